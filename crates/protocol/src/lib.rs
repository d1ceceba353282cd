#[cfg(test)]
#[path = "tests/node.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::identity::Keypair;
use libp2p::{PeerId, StreamProtocol};
use parking_lot::RwLock;
use tokio::io::AsyncRead;
use tracing::warn;

pub mod auth;
pub mod discovery;
pub mod progress;
pub mod push;
pub mod stream;
pub mod transfer;
pub mod types;
pub mod wire;

#[cfg(test)]
pub(crate) mod mock;

use auth::MessageAuthenticator;
use discovery::{DiscoveredPeer, Discovery, DiscoverySubstrate};
use progress::TransferProgress;
use push::{PushProtocol, PushRequestHandler, PUSH_PROTOCOL};
use stream::BoxStream;
use transfer::{TransferHandler, TransferProtocol, TRANSFER_PROTOCOL};
use types::ProtocolError;

/// Service tag scoping which local-network peers are relevant.
pub const SERVICE_TAG: &str = "peerdrop/0.0.1";

/// The transport that carries protocol streams between peers. Connection
/// management and stream negotiation live entirely behind this seam.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, peer: &DiscoveredPeer) -> Result<(), ProtocolError>;

    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<BoxStream, ProtocolError>;

    async fn close(&self) -> Result<(), ProtocolError>;
}

/// Consumes one inbound stream that arrived for a registered protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle_stream(&self, stream: BoxStream);
}

/// Table of inbound stream handlers keyed by protocol id. The transport
/// layer hands every accepted stream to `dispatch`.
#[derive(Default)]
pub struct StreamRouter {
    handlers: RwLock<HashMap<StreamProtocol, Arc<dyn StreamHandler>>>,
}

impl std::fmt::Debug for StreamRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRouter").finish_non_exhaustive()
    }
}

impl StreamRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, protocol: StreamProtocol, handler: Arc<dyn StreamHandler>) {
        let _ = self.handlers.write().insert(protocol, handler);
    }

    pub async fn dispatch(&self, protocol: &StreamProtocol, mut stream: BoxStream) {
        let handler = self.handlers.read().get(protocol).cloned();

        match handler {
            Some(handler) => handler.handle_stream(stream).await,
            None => {
                warn!(?protocol, "no handler registered for inbound stream");
                stream::RawStream::reset(&mut stream);
            }
        }
    }
}

/// A peerdrop node: explicit composition of the authenticator, the
/// discovery cache, the push handshake, and the transfer session, glued
/// to a transport through narrow interfaces.
pub struct Node {
    auth: Arc<MessageAuthenticator>,
    transport: Arc<dyn Transport>,
    discovery: Discovery,
    push: Arc<PushProtocol>,
    transfer: Arc<TransferProtocol>,
    router: Arc<StreamRouter>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.auth.local_peer_id())
            .finish_non_exhaustive()
    }
}

impl Node {
    #[must_use]
    pub fn new(
        keypair: Keypair,
        transport: Arc<dyn Transport>,
        substrate: Arc<dyn DiscoverySubstrate>,
    ) -> Self {
        let auth = Arc::new(MessageAuthenticator::new(keypair));
        let push = Arc::new(PushProtocol::new(Arc::clone(&auth)));
        let transfer = Arc::new(TransferProtocol::new());

        let router = Arc::new(StreamRouter::new());
        router.register(
            PUSH_PROTOCOL,
            Arc::new(PushStreamHandler {
                push: Arc::clone(&push),
            }),
        );
        router.register(
            TRANSFER_PROTOCOL,
            Arc::new(TransferStreamHandler {
                transfer: Arc::clone(&transfer),
            }),
        );

        Self {
            auth,
            transport,
            discovery: Discovery::new(substrate),
            push,
            transfer,
            router,
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.auth.local_peer_id()
    }

    /// Handler table for the transport layer to dispatch inbound streams
    /// into.
    #[must_use]
    pub fn router(&self) -> Arc<StreamRouter> {
        Arc::clone(&self.router)
    }

    pub fn start_discovery(&self) -> Result<(), ProtocolError> {
        self.discovery.start()
    }

    pub fn stop_discovery(&self) -> Result<(), ProtocolError> {
        self.discovery.stop()
    }

    #[must_use]
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.discovery.peers()
    }

    pub fn register_request_handler(&self, handler: Arc<dyn PushRequestHandler>) {
        self.push.register_request_handler(handler);
    }

    /// Arms the transfer protocol for the one inbound transfer that was
    /// just accepted.
    pub fn expect_transfer(&self, handler: Arc<dyn TransferHandler>) {
        self.transfer.expect_transfer(handler);
    }

    pub async fn connect(&self, peer: &DiscoveredPeer) -> Result<(), ProtocolError> {
        self.transport.connect(peer).await
    }

    pub async fn close(&self) -> Result<(), ProtocolError> {
        let _ = self.stop_discovery();
        self.transport.close().await
    }

    /// Runs the push handshake against `peer_id`. Returns whether the
    /// peer accepted the proposed transfer.
    pub async fn send_push_request(
        &self,
        peer_id: PeerId,
        filename: &str,
        size: i64,
        cid: Vec<u8>,
    ) -> Result<bool, ProtocolError> {
        let stream = self.transport.open_stream(peer_id, PUSH_PROTOCOL).await?;
        self.push.send_request(stream, filename, size, cid).await
    }

    /// Streams the payload to `peer_id` after an accepted handshake.
    /// Returns the number of bytes sent.
    pub async fn transfer<R>(
        &self,
        peer_id: PeerId,
        reader: R,
        progress: Arc<TransferProgress>,
    ) -> Result<u64, ProtocolError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let stream = self
            .transport
            .open_stream(peer_id, TRANSFER_PROTOCOL)
            .await?;
        self.transfer.send_file(stream, reader, progress).await
    }

    /// Signs `message` and writes it to `stream`, closing the write half.
    pub async fn send<S, M>(&self, stream: &mut S, message: &mut M) -> Result<(), ProtocolError>
    where
        S: stream::RawStream,
        M: wire::SignedMessage,
    {
        stream::send(&self.auth, stream, message).await
    }

    /// Reads one message from `stream` and verifies its authenticity.
    pub async fn read<S, M>(&self, stream: &mut S) -> Result<M, ProtocolError>
    where
        S: stream::RawStream,
        M: wire::SignedMessage,
    {
        stream::read(&self.auth, stream).await
    }
}

struct PushStreamHandler {
    push: Arc<PushProtocol>,
}

#[async_trait]
impl StreamHandler for PushStreamHandler {
    async fn handle_stream(&self, stream: BoxStream) {
        if let Err(err) = self.push.on_push_request(stream).await {
            warn!(%err, "inbound push request failed");
        }
    }
}

struct TransferStreamHandler {
    transfer: Arc<TransferProtocol>,
}

#[async_trait]
impl StreamHandler for TransferStreamHandler {
    async fn handle_stream(&self, stream: BoxStream) {
        if let Err(err) = self.transfer.on_transfer(stream).await {
            warn!(%err, "inbound transfer failed");
        }
    }
}
