use std::io;

use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use super::*;
use crate::mock::{stream_pair, FakeSubstrate, FakeTransport, SharedVecWriter};
use crate::transfer::ProgressStream;
use crate::wire::{PushRequest, SignedMessage};

struct SinkHandler {
    peer_id: PeerId,
    limit: u64,
    sink: SharedVecWriter,
    outcome: Mutex<Option<Result<u64, String>>>,
}

#[async_trait]
impl TransferHandler for SinkHandler {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    async fn open_sink(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        Ok(Box::new(self.sink.clone()))
    }

    async fn transfer_started(&self, _updates: ProgressStream) {}

    async fn transfer_done(&self, result: &Result<u64, ProtocolError>) {
        *self.outcome.lock() = Some(match result {
            Ok(received) => Ok(*received),
            Err(err) => Err(err.to_string()),
        });
    }
}

/// Accepts every push request and arms the node for the transfer that
/// follows it.
struct AcceptAndArm {
    node: Arc<Node>,
    sink: SharedVecWriter,
    armed: Mutex<Option<Arc<SinkHandler>>>,
}

#[async_trait]
impl PushRequestHandler for AcceptAndArm {
    async fn handle_push_request(&self, request: &PushRequest) -> bool {
        let handler = Arc::new(SinkHandler {
            peer_id: request.peer_id().unwrap(),
            limit: request.size.try_into().unwrap(),
            sink: self.sink.clone(),
            outcome: Mutex::new(None),
        });

        self.node
            .expect_transfer(Arc::clone(&handler) as Arc<dyn TransferHandler>);
        *self.armed.lock() = Some(handler);
        true
    }
}

#[tokio::test]
async fn push_then_transfer_end_to_end() {
    let sender_keypair = Keypair::generate_ed25519();
    let receiver_keypair = Keypair::generate_ed25519();
    let sender_id = sender_keypair.public().to_peer_id();
    let receiver_id = receiver_keypair.public().to_peer_id();

    let (push_out, push_in) = stream_pair(sender_id, receiver_id);
    let (transfer_out, transfer_in) = stream_pair(sender_id, receiver_id);

    let sender_transport = FakeTransport::default();
    sender_transport.stage(PUSH_PROTOCOL, push_out);
    sender_transport.stage(TRANSFER_PROTOCOL, transfer_out);

    let sender_node = Node::new(
        sender_keypair,
        Arc::new(sender_transport),
        Arc::new(FakeSubstrate::default()),
    );
    let receiver_node = Arc::new(Node::new(
        receiver_keypair,
        Arc::new(FakeTransport::default()),
        Arc::new(FakeSubstrate::default()),
    ));

    let sink = SharedVecWriter::default();
    let accept = Arc::new(AcceptAndArm {
        node: Arc::clone(&receiver_node),
        sink: sink.clone(),
        armed: Mutex::new(None),
    });
    receiver_node.register_request_handler(Arc::clone(&accept) as Arc<dyn PushRequestHandler>);

    // The transport side of the receiver: dispatch inbound streams to
    // their protocol handlers.
    let router = receiver_node.router();
    let receiving = tokio::spawn(async move {
        router.dispatch(&PUSH_PROTOCOL, Box::new(push_in)).await;
        router.dispatch(&TRANSFER_PROTOCOL, Box::new(transfer_in)).await;
    });

    let accepted = sender_node
        .send_push_request(receiver_id, "a.txt", 13, vec![7_u8; 32])
        .await
        .unwrap();
    assert!(accepted);

    let progress = TransferProgress::new(13);
    let sent = sender_node
        .transfer(receiver_id, &b"Hello, world!"[..], Arc::clone(&progress))
        .await
        .unwrap();

    receiving.await.unwrap();

    assert_eq!(sent, 13);
    assert!(progress.is_complete());
    assert_eq!(sink.contents(), b"Hello, world!");

    let armed = accept.armed.lock().clone().unwrap();
    assert_eq!(*armed.outcome.lock(), Some(Ok(13)));
}

#[tokio::test]
async fn unrouted_protocol_resets_the_stream() {
    let router = StreamRouter::new();
    let (_out, inbound) = stream_pair(PeerId::random(), PeerId::random());
    let reset = inbound.reset_flag();

    router
        .dispatch(
            &StreamProtocol::new("/peerdrop/unknown/0.0.1"),
            Box::new(inbound),
        )
        .await;

    assert!(reset.load(std::sync::atomic::Ordering::SeqCst));
}
