use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{bail, Result as EyreResult, WrapErr};
use futures_util::StreamExt;
use libp2p::identity::Keypair;
use libp2p::mdns;
use libp2p::noise::Config as NoiseConfig;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::tcp::Config as TcpConfig;
use libp2p::yamux::Config as YamuxConfig;
use libp2p::{Multiaddr, PeerId, Stream as P2pStream, StreamProtocol, Swarm, SwarmBuilder};
use libp2p_stream::{Behaviour as StreamBehaviour, Control, IncomingStreams};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tracing::{debug, warn};

use peerdrop_protocol::discovery::{DiscoveredPeer, DiscoverySubstrate, SightingCallback};
use peerdrop_protocol::push::PUSH_PROTOCOL;
use peerdrop_protocol::stream::{BoxStream, RawStream};
use peerdrop_protocol::transfer::TRANSFER_PROTOCOL;
use peerdrop_protocol::types::ProtocolError;
use peerdrop_protocol::{StreamRouter, Transport};

#[derive(NetworkBehaviour)]
struct Behaviour {
    mdns: mdns::tokio::Behaviour,
    stream: StreamBehaviour,
}

/// The libp2p side of a node: tcp + noise + yamux transport, mDNS for
/// local sightings, and one stream protocol each for push and transfer.
/// Implements the protocol core's transport and discovery seams.
pub struct Host {
    local_peer_id: PeerId,
    control: Mutex<Control>,
    commands: mpsc::Sender<Command>,
    router: Arc<Mutex<Option<Arc<StreamRouter>>>>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("local_peer_id", &self.local_peer_id)
            .finish_non_exhaustive()
    }
}

enum Command {
    Dial {
        peer: DiscoveredPeer,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Subscribe(SightingCallback),
    Unsubscribe,
    Shutdown,
}

impl Host {
    /// Builds the swarm, starts listening, and spawns the event loop and
    /// the inbound stream dispatchers. Streams are routed once
    /// [`Host::attach_router`] has been called.
    pub async fn start(keypair: Keypair, port: u16) -> EyreResult<Arc<Self>> {
        let local_peer_id = keypair.public().to_peer_id();

        let mdns_behaviour =
            mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
                .wrap_err("failed to set up the mDNS behaviour")?;

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(TcpConfig::default(), NoiseConfig::new, YamuxConfig::default)?
            .with_behaviour(|_key| Behaviour {
                mdns: mdns_behaviour,
                stream: StreamBehaviour::new(),
            })?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(30)))
            .build();

        let mut control = swarm.behaviour().stream.new_control();
        let push_streams = match control.accept(PUSH_PROTOCOL) {
            Ok(streams) => streams,
            Err(err) => bail!("failed to accept the push protocol: {err:?}"),
        };
        let transfer_streams = match control.accept(TRANSFER_PROTOCOL) {
            Ok(streams) => streams,
            Err(err) => bail!("failed to accept the transfer protocol: {err:?}"),
        };

        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{port}").parse()?;
        let _ = swarm.listen_on(listen)?;

        let (commands, command_receiver) = mpsc::channel(32);
        let router = Arc::new(Mutex::new(None));

        let host = Arc::new(Self {
            local_peer_id,
            control: Mutex::new(control),
            commands,
            router: Arc::clone(&router),
        });

        let event_loop = EventLoop {
            swarm,
            command_receiver,
            sightings: None,
            pending_dials: HashMap::new(),
        };
        drop(tokio::spawn(event_loop.run()));

        drop(tokio::spawn(dispatch_incoming(
            push_streams,
            PUSH_PROTOCOL,
            Arc::clone(&router),
        )));
        drop(tokio::spawn(dispatch_incoming(
            transfer_streams,
            TRANSFER_PROTOCOL,
            router,
        )));

        Ok(host)
    }

    /// Wires inbound streams to the node's handler table.
    pub fn attach_router(&self, router: Arc<StreamRouter>) {
        *self.router.lock() = Some(router);
    }

    #[must_use]
    pub const fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

async fn dispatch_incoming(
    mut streams: IncomingStreams,
    protocol: StreamProtocol,
    router: Arc<Mutex<Option<Arc<StreamRouter>>>>,
) {
    while let Some((peer, stream)) = streams.next().await {
        let Some(router) = router.lock().clone() else {
            debug!(%peer, ?protocol, "inbound stream before the router was attached");
            drop(stream);
            continue;
        };

        debug!(%peer, ?protocol, "inbound stream");

        let protocol = protocol.clone();
        drop(tokio::spawn(async move {
            router
                .dispatch(&protocol, Box::new(HostStream::new(peer, stream)))
                .await;
        }));
    }
}

#[async_trait]
impl Transport for Host {
    async fn connect(&self, peer: &DiscoveredPeer) -> Result<(), ProtocolError> {
        let (reply, answer) = oneshot::channel();

        self.commands
            .send(Command::Dial {
                peer: peer.clone(),
                reply,
            })
            .await
            .map_err(|_| closed())?;

        answer.await.map_err(|_| closed())?
    }

    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<BoxStream, ProtocolError> {
        let mut control = { self.control.lock().clone() };

        let stream = control
            .open_stream(peer_id, protocol)
            .await
            .map_err(|err| ProtocolError::Transport(io::Error::other(err.to_string())))?;

        Ok(Box::new(HostStream::new(peer_id, stream)))
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        let _ = self.commands.send(Command::Shutdown).await;
        Ok(())
    }
}

impl DiscoverySubstrate for Host {
    fn start(&self, service: &str, on_peer_found: SightingCallback) -> Result<(), ProtocolError> {
        // rust-libp2p's mDNS always advertises the stock `_p2p._udp.local`
        // service; peers outside `service` are weeded out by the push and
        // transfer protocol ids instead.
        debug!(service, "subscribing to mDNS sightings");

        self.commands
            .try_send(Command::Subscribe(on_peer_found))
            .map_err(|_| closed())
    }

    fn stop(&self) -> Result<(), ProtocolError> {
        self.commands
            .try_send(Command::Unsubscribe)
            .map_err(|_| closed())
    }
}

fn closed() -> ProtocolError {
    ProtocolError::Transport(io::Error::other("the host event loop is gone"))
}

struct EventLoop {
    swarm: Swarm<Behaviour>,
    command_receiver: mpsc::Receiver<Command>,
    sightings: Option<SightingCallback>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), ProtocolError>>>>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.command_receiver.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command) {
                        break;
                    }
                }
            }
        }

        debug!("host event loop finished");
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(BehaviourEvent::Mdns(event)) => self.handle_mdns_event(event),
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(%peer_id, "connection established");
                for reply in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                warn!(%peer_id, %error, "failed to dial peer");
                for reply in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = reply.send(Err(ProtocolError::Transport(io::Error::other(
                        error.to_string(),
                    ))));
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                debug!(%address, "listening");
            }
            _ => {}
        }
    }

    fn handle_mdns_event(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(peers) => {
                let Some(on_peer_found) = &self.sightings else {
                    return;
                };

                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in peers {
                    by_peer.entry(peer_id).or_default().push(addr);
                }

                for (peer_id, addrs) in by_peer {
                    debug!(%peer_id, "sighted peer");
                    on_peer_found(DiscoveredPeer { peer_id, addrs });
                }
            }
            // The discovery cache ages peers out on its own schedule.
            mdns::Event::Expired(_) => {}
        }
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe(callback) => self.sightings = Some(callback),
            Command::Unsubscribe => self.sightings = None,
            Command::Dial { peer, reply } => {
                if self.swarm.is_connected(&peer.peer_id) {
                    let _ = reply.send(Ok(()));
                    return false;
                }

                let opts = DialOpts::peer_id(peer.peer_id)
                    .addresses(peer.addrs.clone())
                    .build();

                match self.swarm.dial(opts) {
                    Ok(()) => self
                        .pending_dials
                        .entry(peer.peer_id)
                        .or_default()
                        .push(reply),
                    Err(err) => {
                        let _ = reply.send(Err(ProtocolError::Transport(io::Error::other(
                            err.to_string(),
                        ))));
                    }
                }
            }
            Command::Shutdown => return true,
        }

        false
    }
}

/// A libp2p stream adapted to the protocol core's stream seam. Resetting
/// drops the underlying stream, which aborts it on the wire.
struct HostStream {
    peer: PeerId,
    io: Option<Compat<P2pStream>>,
}

impl HostStream {
    fn new(peer: PeerId, stream: P2pStream) -> Self {
        Self {
            peer,
            io: Some(stream.compat()),
        }
    }
}

impl RawStream for HostStream {
    fn remote_peer(&self) -> PeerId {
        self.peer
    }

    fn reset(&mut self) {
        drop(self.io.take());
    }
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream was reset")
}

impl AsyncRead for HostStream {
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

impl AsyncWrite for HostStream {
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
