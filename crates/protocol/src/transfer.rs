#[cfg(test)]
#[path = "tests/transfer.rs"]
mod tests;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{PeerId, StreamProtocol};
use parking_lot::RwLock;
use tokio::io::{copy, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::progress::{self, Progress, ProgressReader, ProgressWriter, TransferProgress};
use crate::stream::RawStream;
use crate::types::ProtocolError;

pub const TRANSFER_PROTOCOL: StreamProtocol = StreamProtocol::new("/peerdrop/transfer/0.0.1");

/// How long the receiver waits for a clean end of stream after the
/// declared size has arrived.
pub const DEFAULT_EOF_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshots emitted by a running transfer session.
pub type ProgressStream = ReceiverStream<Progress>;

/// One expected inbound transfer, registered when a push request is
/// accepted. Supplies the sink for the payload and observes the session.
#[async_trait]
pub trait TransferHandler: Send + Sync {
    /// The peer the payload must come from.
    fn peer_id(&self) -> PeerId;

    /// The declared payload size from the accepted push request.
    fn limit(&self) -> u64;

    async fn open_sink(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Called once with the session's progress stream before any payload
    /// bytes move. Dropping the stream cancels the reporting, not the
    /// transfer.
    async fn transfer_started(&self, updates: ProgressStream);

    async fn transfer_done(&self, result: &Result<u64, ProtocolError>);
}

/// Streams raw payload bytes once a handshake has been accepted and
/// detects end of data within a bounded wait.
pub struct TransferProtocol {
    handler: RwLock<Option<Arc<dyn TransferHandler>>>,
    eof_timeout: Duration,
    tick_interval: Duration,
}

impl std::fmt::Debug for TransferProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferProtocol")
            .field("eof_timeout", &self.eof_timeout)
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl Default for TransferProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timing(DEFAULT_EOF_TIMEOUT, progress::DEFAULT_TICK_INTERVAL)
    }

    #[must_use]
    pub fn with_timing(eof_timeout: Duration, tick_interval: Duration) -> Self {
        Self {
            handler: RwLock::new(None),
            eof_timeout,
            tick_interval,
        }
    }

    /// Arms the receiver for exactly one inbound transfer.
    pub fn expect_transfer(&self, handler: Arc<dyn TransferHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Sender side: stream everything `reader` yields, then close the
    /// write half. Returns the number of payload bytes sent.
    pub async fn send_file<S, R>(
        &self,
        mut stream: S,
        reader: R,
        progress: Arc<TransferProgress>,
    ) -> Result<u64, ProtocolError>
    where
        S: RawStream,
        R: AsyncRead + Send + Unpin,
    {
        let mut counted = ProgressReader::new(reader, Arc::clone(&progress));

        let sent = match copy(&mut counted, &mut stream).await {
            Ok(sent) => sent,
            Err(err) => {
                progress.fail(&err);
                stream.reset();
                return Err(err.into());
            }
        };

        stream.shutdown().await?;

        Ok(sent)
    }

    /// Receiver side: consume the payload of the one expected transfer.
    /// Reads at most the declared size, then waits (bounded) for a clean
    /// end of stream. Returns the number of payload bytes received.
    pub async fn on_transfer<S: RawStream>(&self, mut stream: S) -> Result<u64, ProtocolError> {
        let Some(handler) = self.handler.write().take() else {
            warn!(
                peer_id = %stream.remote_peer(),
                "received data transfer attempt with no transfer pending"
            );
            stream.reset();
            return Err(ProtocolError::Violation(
                "no transfer pending".to_owned(),
            ));
        };

        if stream.remote_peer() != handler.peer_id() {
            warn!(
                peer_id = %stream.remote_peer(),
                "received data transfer attempt from unexpected peer"
            );
            stream.reset();
            // Keep expecting the peer that was actually accepted.
            *self.handler.write() = Some(handler);
            return Err(ProtocolError::Violation(
                "transfer from a peer other than the accepted one".to_owned(),
            ));
        }

        let limit = handler.limit();
        let progress = TransferProgress::new(limit);
        handler
            .transfer_started(progress::watch(&progress, self.tick_interval))
            .await;

        let result = self.consume(&mut stream, &*handler, &progress, limit).await;
        if result.is_err() {
            stream.reset();
        }

        handler.transfer_done(&result).await;
        result
    }

    async fn consume<S: RawStream>(
        &self,
        stream: &mut S,
        handler: &dyn TransferHandler,
        progress: &Arc<TransferProgress>,
        limit: u64,
    ) -> Result<u64, ProtocolError> {
        let sink = match handler.open_sink().await {
            Ok(sink) => sink,
            Err(err) => {
                progress.fail(&err);
                return Err(err.into());
            }
        };
        let mut counted = ProgressWriter::new(sink, Arc::clone(progress));

        let mut limited = (&mut *stream).take(limit);
        let received = match copy(&mut limited, &mut counted).await {
            Ok(received) => received,
            Err(err) => {
                progress.fail(&err);
                return Err(err.into());
            }
        };

        if let Err(err) = counted.shutdown().await {
            progress.fail(&err);
            return Err(err.into());
        }

        match wait_for_eof(limited.into_inner(), self.eof_timeout).await {
            Ok(()) => {
                progress.finish();
                Ok(received)
            }
            Err(err) => {
                progress.fail(&err);
                Err(err)
            }
        }
    }
}

/// Waits, bounded, for the stream to end cleanly: a zero-byte read means
/// success, any further byte means the sender overran its declared size,
/// and silence until the deadline is a timeout.
pub(crate) async fn wait_for_eof<S>(stream: &mut S, bound: Duration) -> Result<(), ProtocolError>
where
    S: AsyncRead + Send + Unpin,
{
    let mut byte = [0_u8; 1];

    match timeout(bound, stream.read(&mut byte)).await {
        Err(_) => Err(ProtocolError::Timeout),
        Ok(Ok(0)) => Ok(()),
        Ok(Ok(_)) => Err(ProtocolError::UnexpectedData),
        Ok(Err(err)) => Err(err.into()),
    }
}
