use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::discovery::{DiscoveredPeer, DiscoverySubstrate, SightingCallback};
use crate::stream::{BoxStream, RawStream};
use crate::types::ProtocolError;
use crate::Transport;

/// In-memory stream with an attributed remote peer, as the transport
/// would hand out. Resetting severs the pipe so the other side observes
/// the teardown.
#[derive(Debug)]
pub(crate) struct TestStream {
    remote: PeerId,
    io: Option<DuplexStream>,
    was_reset: Arc<AtomicBool>,
}

impl TestStream {
    pub(crate) fn reset_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.was_reset)
    }
}

/// A connected pair of [`TestStream`]s between `left` and `right`.
pub(crate) fn stream_pair(left: PeerId, right: PeerId) -> (TestStream, TestStream) {
    let (left_io, right_io) = tokio::io::duplex(64 * 1_024);

    (
        TestStream {
            remote: right,
            io: Some(left_io),
            was_reset: Arc::new(AtomicBool::new(false)),
        },
        TestStream {
            remote: left,
            io: Some(right_io),
            was_reset: Arc::new(AtomicBool::new(false)),
        },
    )
}

impl RawStream for TestStream {
    fn remote_peer(&self) -> PeerId {
        self.remote
    }

    fn reset(&mut self) {
        self.was_reset.store(true, Ordering::SeqCst);
        drop(self.io.take());
    }
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream was reset")
}

impl AsyncRead for TestStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().io.as_mut() {
            Some(io) => Pin::new(io).poll_read(cx, buf),
            None => Poll::Ready(Err(gone())),
        }
    }
}

impl AsyncWrite for TestStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().io.as_mut() {
            Some(io) => Pin::new(io).poll_write(cx, buf),
            None => Poll::Ready(Err(gone())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().io.as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Err(gone())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().io.as_mut() {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Err(gone())),
        }
    }
}

/// Sink collecting everything written to it, shared with the test body.
#[derive(Clone, Debug, Default)]
pub(crate) struct SharedVecWriter {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedVecWriter {
    pub(crate) fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl AsyncWrite for SharedVecWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.bytes.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Substrate stand-in: hands the sighting callback back to the test and
/// counts start/stop calls.
#[derive(Default)]
pub(crate) struct FakeSubstrate {
    callback: Mutex<Option<SightingCallback>>,
    service: Mutex<Option<String>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeSubstrate {
    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn callback(&self) -> Option<SightingCallback> {
        self.callback.lock().clone()
    }

    pub(crate) fn service(&self) -> Option<String> {
        self.service.lock().clone()
    }
}

impl DiscoverySubstrate for FakeSubstrate {
    fn start(&self, service: &str, on_peer_found: SightingCallback) -> Result<(), ProtocolError> {
        *self.callback.lock() = Some(on_peer_found);
        *self.service.lock() = Some(service.to_owned());
        let _ = self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), ProtocolError> {
        *self.callback.lock() = None;
        let _ = self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport stand-in handing out pre-staged streams per protocol.
#[derive(Default)]
pub(crate) struct FakeTransport {
    staged: Mutex<HashMap<StreamProtocol, VecDeque<TestStream>>>,
}

impl FakeTransport {
    pub(crate) fn stage(&self, protocol: StreamProtocol, stream: TestStream) {
        self.staged.lock().entry(protocol).or_default().push_back(stream);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _peer: &DiscoveredPeer) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn open_stream(
        &self,
        _peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<BoxStream, ProtocolError> {
        let staged = self
            .staged
            .lock()
            .get_mut(&protocol)
            .and_then(VecDeque::pop_front);

        staged
            .map(|stream| Box::new(stream) as BoxStream)
            .ok_or_else(|| ProtocolError::Violation("no stream staged for protocol".to_owned()))
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}
