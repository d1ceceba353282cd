use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

use super::*;
use crate::mock::{stream_pair, SharedVecWriter};

struct RecordingHandler {
    peer_id: PeerId,
    limit: u64,
    sink: SharedVecWriter,
    updates: Mutex<Option<ProgressStream>>,
    outcome: Mutex<Option<Result<u64, String>>>,
}

impl RecordingHandler {
    fn new(peer_id: PeerId, limit: u64) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            limit,
            sink: SharedVecWriter::default(),
            updates: Mutex::new(None),
            outcome: Mutex::new(None),
        })
    }
}

#[async_trait]
impl TransferHandler for RecordingHandler {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    async fn open_sink(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        Ok(Box::new(self.sink.clone()))
    }

    async fn transfer_started(&self, updates: ProgressStream) {
        *self.updates.lock() = Some(updates);
    }

    async fn transfer_done(&self, result: &Result<u64, ProtocolError>) {
        *self.outcome.lock() = Some(match result {
            Ok(received) => Ok(*received),
            Err(err) => Err(err.to_string()),
        });
    }
}

#[tokio::test]
async fn eof_wait_accepts_a_clean_close() {
    let (mut near, mut far) = tokio::io::duplex(64);

    far.shutdown().await.unwrap();
    wait_for_eof(&mut near, Duration::from_millis(100))
        .await
        .unwrap();
}

#[tokio::test]
async fn eof_wait_rejects_late_data() {
    let (mut near, mut far) = tokio::io::duplex(64);

    far.write_all(b"x").await.unwrap();
    let err = wait_for_eof(&mut near, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnexpectedData));
}

#[tokio::test(start_paused = true)]
async fn eof_wait_times_out_on_silence() {
    let (mut near, _far) = tokio::io::duplex(64);

    let err = wait_for_eof(&mut near, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout));
}

#[tokio::test]
async fn payload_is_received_and_persisted() {
    let sender_id = PeerId::random();
    let receiver_id = PeerId::random();
    let (sender_stream, receiver_stream) = stream_pair(sender_id, receiver_id);

    let handler = RecordingHandler::new(sender_id, 13);
    let receiver = TransferProtocol::with_timing(
        Duration::from_secs(1),
        Duration::from_millis(10),
    );
    receiver.expect_transfer(Arc::clone(&handler) as Arc<dyn TransferHandler>);

    let sending = tokio::spawn(async move {
        let sender = TransferProtocol::new();
        let progress = TransferProgress::new(13);
        sender
            .send_file(sender_stream, &b"Hello, world!"[..], progress)
            .await
    });

    let received = receiver.on_transfer(receiver_stream).await.unwrap();

    assert_eq!(received, 13);
    assert_eq!(sending.await.unwrap().unwrap(), 13);
    assert_eq!(handler.sink.contents(), b"Hello, world!");
    assert_eq!(*handler.outcome.lock(), Some(Ok(13)));

    // The session's final snapshot reports a complete transfer.
    let mut updates = handler.updates.lock().take().unwrap();
    let mut last = None;
    while let Some(snapshot) = updates.next().await {
        last = Some(snapshot);
    }
    let last = last.unwrap();
    assert!(last.complete);
    assert_eq!(last.transferred, 13);
}

#[tokio::test]
async fn transfer_without_a_pending_handshake_is_reset() {
    let (_sender_stream, receiver_stream) = stream_pair(PeerId::random(), PeerId::random());
    let reset = receiver_stream.reset_flag();

    let receiver = TransferProtocol::new();
    let err = receiver.on_transfer(receiver_stream).await.unwrap_err();

    assert!(matches!(err, ProtocolError::Violation(_)));
    assert!(reset.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn transfer_from_an_unexpected_peer_is_reset() {
    let accepted_peer = PeerId::random();
    let other_peer = PeerId::random();
    let (_sender_stream, receiver_stream) = stream_pair(other_peer, PeerId::random());
    let reset = receiver_stream.reset_flag();

    let handler = RecordingHandler::new(accepted_peer, 13);
    let receiver = TransferProtocol::new();
    receiver.expect_transfer(Arc::clone(&handler) as Arc<dyn TransferHandler>);

    let err = receiver.on_transfer(receiver_stream).await.unwrap_err();

    assert!(matches!(err, ProtocolError::Violation(_)));
    assert!(reset.load(std::sync::atomic::Ordering::SeqCst));
    // The accepted peer is still being waited for.
    assert!(handler.outcome.lock().is_none());
}

#[tokio::test]
async fn bytes_beyond_the_declared_size_fail_the_session() {
    let sender_id = PeerId::random();
    let (mut sender_stream, receiver_stream) = stream_pair(sender_id, PeerId::random());

    let handler = RecordingHandler::new(sender_id, 13);
    let receiver = TransferProtocol::with_timing(
        Duration::from_secs(1),
        Duration::from_millis(10),
    );
    receiver.expect_transfer(Arc::clone(&handler) as Arc<dyn TransferHandler>);

    // 20 bytes against a declared size of 13; the stream stays open.
    let writing = tokio::spawn(async move {
        sender_stream.write_all(&[b'a'; 20]).await.unwrap();
        sender_stream
    });

    let err = receiver.on_transfer(receiver_stream).await.unwrap_err();
    assert!(matches!(err, ProtocolError::UnexpectedData));

    let outcome = handler.outcome.lock().clone().unwrap();
    assert!(outcome.is_err());

    drop(writing.await.unwrap());
}
