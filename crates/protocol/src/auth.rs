#[cfg(test)]
#[path = "tests/auth.rs"]
mod tests;

use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;

use crate::types::{AuthenticationError, ProtocolError};
use crate::wire::{Header, SignedMessage};

/// Signs outgoing protocol messages with the local identity and verifies
/// that incoming ones were authored by the node they claim to come from.
///
/// The signature always covers the message's canonical encoded form with
/// the signature field cleared, so signing is two-phase: populate the
/// header, encode, sign, then store the signature back into the header.
#[derive(Clone, Debug)]
pub struct MessageAuthenticator {
    keypair: Keypair,
    verify_messages: bool,
}

impl MessageAuthenticator {
    #[must_use]
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            verify_messages: true,
        }
    }

    /// An authenticator that signs but accepts every incoming message
    /// without verification. For hosts running with throwaway keys.
    #[must_use]
    pub fn without_verification(keypair: Keypair) -> Self {
        Self {
            keypair,
            verify_messages: false,
        }
    }

    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    /// Populates a fresh header and signs the message with the local key.
    pub fn sign<M: SignedMessage>(&self, message: &mut M) -> Result<(), ProtocolError> {
        let public = self.keypair.public();

        let mut header = Header::unsigned(
            public.to_peer_id().to_base58(),
            public.encode_protobuf(),
        );
        message.set_header(header.clone());

        let unsigned = serde_json::to_vec(message).map_err(ProtocolError::Serialization)?;

        header.signature = self
            .keypair
            .sign(&unsigned)
            .map_err(AuthenticationError::Signing)?;
        message.set_header(header);

        Ok(())
    }

    /// Checks that the header's node id matches the embedded public key
    /// and that the signature covers the message as transmitted.
    pub fn verify<M: SignedMessage>(&self, message: &M) -> Result<(), ProtocolError> {
        if !self.verify_messages {
            return Ok(());
        }

        let header = message
            .header()
            .ok_or(AuthenticationError::MissingHeader)?;

        let claimed: PeerId = header
            .node_id
            .parse()
            .map_err(AuthenticationError::InvalidNodeId)?;

        let public = PublicKey::try_decode_protobuf(&header.node_pub_key)
            .map_err(AuthenticationError::InvalidPublicKey)?;

        if PeerId::from_public_key(&public) != claimed {
            return Err(AuthenticationError::IdentityMismatch.into());
        }

        let signature = header.signature.clone();

        let mut unsigned = message.clone();
        if let Some(header) = unsigned.header_mut() {
            header.signature = Vec::new();
        }
        let bytes = serde_json::to_vec(&unsigned).map_err(ProtocolError::Serialization)?;

        if !public.verify(&bytes, &signature) {
            return Err(AuthenticationError::BadSignature.into());
        }

        Ok(())
    }
}
