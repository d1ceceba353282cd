use std::time::{SystemTime, UNIX_EPOCH};

use libp2p::PeerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AuthenticationError, ProtocolError};

/// Header shared by every protocol message.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// A unique request id to allow idempotency.
    pub request_id: String,
    /// Unix time in seconds.
    pub timestamp: i64,
    /// Base58 id of the node that authored the message (not necessarily
    /// the peer that relayed it).
    pub node_id: String,
    /// Authoring node public key, protobuf-encoded.
    pub node_pub_key: Vec<u8>,
    /// Signature over the message with this field cleared.
    pub signature: Vec<u8>,
}

impl Header {
    pub(crate) fn unsigned(node_id: String, node_pub_key: Vec<u8>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            timestamp: unix_now(),
            node_id,
            node_pub_key,
            signature: Vec::new(),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

/// A message that travels with a signed [`Header`].
pub trait SignedMessage: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn header(&self) -> Option<&Header>;

    fn header_mut(&mut self) -> Option<&mut Header>;

    fn set_header(&mut self, header: Header);

    /// Id of the node that authored the message, decoded from the header.
    fn peer_id(&self) -> Result<PeerId, ProtocolError> {
        let header = self.header().ok_or(AuthenticationError::MissingHeader)?;

        header
            .node_id
            .parse()
            .map_err(|err| AuthenticationError::InvalidNodeId(err).into())
    }
}

/// Proposes a transfer to the receiving peer. Carries just enough for the
/// receiver to decide whether to accept the data that is about to follow.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushRequest {
    pub header: Option<Header>,
    /// Name the receiving peer uses when persisting the file.
    pub filename: String,
    /// Declared payload size in bytes.
    pub size: i64,
    /// Opaque content identifier of the file.
    pub cid: Vec<u8>,
}

impl PushRequest {
    #[must_use]
    pub fn new(filename: impl Into<String>, size: i64, cid: Vec<u8>) -> Self {
        Self {
            header: None,
            filename: filename.into(),
            size,
            cid,
        }
    }
}

impl SignedMessage for PushRequest {
    fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    fn header_mut(&mut self) -> Option<&mut Header> {
        self.header.as_mut()
    }

    fn set_header(&mut self, header: Header) {
        self.header = Some(header);
    }
}

/// The receiver's accept/reject decision for a [`PushRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushResponse {
    pub header: Option<Header>,
    pub accept: bool,
}

impl PushResponse {
    #[must_use]
    pub const fn new(accept: bool) -> Self {
        Self {
            header: None,
            accept,
        }
    }
}

impl SignedMessage for PushResponse {
    fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    fn header_mut(&mut self) -> Option<&mut Header> {
        self.header.as_mut()
    }

    fn set_header(&mut self, header: Header) {
        self.header = Some(header);
    }
}
