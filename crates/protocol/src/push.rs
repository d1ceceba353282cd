#[cfg(test)]
#[path = "tests/push.rs"]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;
use libp2p::StreamProtocol;
use parking_lot::RwLock;
use tracing::warn;

use crate::auth::MessageAuthenticator;
use crate::stream::{self, RawStream};
use crate::types::ProtocolError;
use crate::wire::{PushRequest, PushResponse, SignedMessage};

pub const PUSH_PROTOCOL: StreamProtocol = StreamProtocol::new("/peerdrop/push/0.0.1");

/// Decides whether a validated inbound push request is accepted.
#[async_trait]
pub trait PushRequestHandler: Send + Sync {
    async fn handle_push_request(&self, request: &PushRequest) -> bool;
}

/// The push handshake: a signed request proposing a transfer, answered by
/// a signed accept/reject response. Nothing is streamed until the request
/// has been authenticated and accepted.
pub struct PushProtocol {
    auth: Arc<MessageAuthenticator>,
    handler: RwLock<Option<Arc<dyn PushRequestHandler>>>,
}

impl std::fmt::Debug for PushProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushProtocol")
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl PushProtocol {
    #[must_use]
    pub fn new(auth: Arc<MessageAuthenticator>) -> Self {
        Self {
            auth,
            handler: RwLock::new(None),
        }
    }

    pub fn register_request_handler(&self, handler: Arc<dyn PushRequestHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Sender half of the handshake. Writes a signed request, closes the
    /// write half of the stream, then waits for the peer's signed
    /// decision. Returns whether the transfer was accepted.
    pub async fn send_request<S: RawStream>(
        &self,
        mut stream: S,
        filename: &str,
        size: i64,
        cid: Vec<u8>,
    ) -> Result<bool, ProtocolError> {
        let target = stream.remote_peer();

        let mut request = PushRequest::new(filename, size, cid);
        stream::send(&self.auth, &mut stream, &mut request).await?;

        let response: PushResponse = stream::read(&self.auth, &mut stream).await?;

        if response.peer_id()? != target {
            stream.reset();
            return Err(ProtocolError::Violation(
                "push response authored by a peer other than the target".to_owned(),
            ));
        }

        Ok(response.accept)
    }

    /// Receiver half of the handshake. Reads and authenticates a request,
    /// asks the registered handler for a decision, and answers with a
    /// signed response. Returns whether the transfer was accepted.
    pub async fn on_push_request<S: RawStream>(&self, mut stream: S) -> Result<bool, ProtocolError> {
        let request: PushRequest = stream::read(&self.auth, &mut stream).await?;

        if request.peer_id()? != stream.remote_peer() {
            warn!(
                peer_id = %stream.remote_peer(),
                "received push request authored by an unexpected peer"
            );
            stream.reset();
            return Err(ProtocolError::Violation(
                "push request authored by a peer other than the stream's".to_owned(),
            ));
        }

        let handler = self.handler.read().clone();
        let accept = match handler {
            Some(handler) => handler.handle_push_request(&request).await,
            None => {
                warn!("no push request handler registered, rejecting");
                false
            }
        };

        let mut response = PushResponse::new(accept);
        stream::send(&self.auth, &mut stream, &mut response).await?;

        Ok(accept)
    }
}
