use libp2p_identity::{DecodingError, ParseError, SigningError};
use thiserror::Error;

use crate::stream::CodecError;

/// Errors surfaced by the protocol core. Stream-level faults reset the
/// stream before the error is returned; nothing in this layer retries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("failed to encode or decode a protocol message")]
    Serialization(#[source] serde_json::Error),

    #[error("message authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("transport failure")]
    Transport(#[from] std::io::Error),

    #[error("stream returned data after the declared end of transfer")]
    UnexpectedData,
}

/// The distinct ways authenticating a signed message can fail.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthenticationError {
    #[error("message carries no header")]
    MissingHeader,

    #[error("node id in header could not be decoded")]
    InvalidNodeId(#[source] ParseError),

    #[error("public key in header could not be decoded")]
    InvalidPublicKey(#[source] DecodingError),

    #[error("node id and embedded public key mismatch")]
    IdentityMismatch,

    #[error("invalid message signature")]
    BadSignature,

    #[error("could not sign message")]
    Signing(#[source] SigningError),
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::StdIo(err) => Self::Transport(err),
            CodecError::SerDe(err) => Self::Serialization(err),
        }
    }
}
