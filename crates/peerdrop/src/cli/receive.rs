use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use eyre::{bail, Result as EyreResult};
use libp2p::PeerId;
use tokio::io::AsyncWrite;
use tracing::{info, warn};

use peerdrop_protocol::discovery::DiscoverySubstrate;
use peerdrop_protocol::push::PushRequestHandler;
use peerdrop_protocol::transfer::{ProgressStream, TransferHandler};
use peerdrop_protocol::types::ProtocolError;
use peerdrop_protocol::wire::{PushRequest, SignedMessage};
use peerdrop_protocol::{Node, Transport};

use crate::cli::{read_line, spawn_progress_printer, RootArgs};
use crate::config::Settings;
use crate::host::Host;

/// Wait for a peer in the local network to push a file over.
#[derive(Debug, Parser)]
pub struct ReceiveCommand {
    /// Directory received files are saved into
    #[arg(value_name = "DEST_DIR", default_value = ".")]
    pub dest: Utf8PathBuf,

    /// Accept every push request without prompting
    #[arg(long, short)]
    pub yes: bool,
}

impl ReceiveCommand {
    pub async fn run(self, root: RootArgs) -> EyreResult<()> {
        if !self.dest.is_dir() {
            bail!("{} is not a directory", self.dest);
        }

        let settings = Settings::load_or_create(&root.home).await?;
        let keypair = settings.keypair()?;

        let host = Host::start(keypair.clone(), root.port).await?;
        let node = Arc::new(Node::new(
            keypair,
            Arc::clone(&host) as Arc<dyn Transport>,
            Arc::clone(&host) as Arc<dyn DiscoverySubstrate>,
        ));
        host.attach_router(node.router());

        info!("Your identity:\n\n\t{}\n", node.peer_id());

        node.start_discovery()?;
        node.register_request_handler(Arc::new(ReceiveHandler {
            node: Arc::clone(&node),
            dest: self.dest,
            auto_accept: self.yes,
        }));

        info!("ready to receive files... (cancel with ctrl+c)");
        tokio::signal::ctrl_c().await?;

        info!("shutting down");
        node.close().await?;
        Ok(())
    }
}

struct ReceiveHandler {
    node: Arc<Node>,
    dest: Utf8PathBuf,
    auto_accept: bool,
}

#[async_trait]
impl PushRequestHandler for ReceiveHandler {
    async fn handle_push_request(&self, request: &PushRequest) -> bool {
        print_request_info(request);

        let accept = self.auto_accept || prompt_accept().await;
        if !accept {
            info!("rejected the request");
            return false;
        }

        let Ok(peer_id) = request.peer_id() else {
            return false;
        };
        let Ok(limit) = u64::try_from(request.size) else {
            warn!(size = request.size, "request declares a negative size");
            return false;
        };

        // Only the base name; a request must not pick the directory.
        let filename = Utf8Path::new(&request.filename)
            .file_name()
            .unwrap_or("received.bin");
        let path = self.dest.join(filename);

        info!("saving the file to {path}");
        self.node.expect_transfer(Arc::new(SaveToFile {
            peer_id,
            limit,
            path,
        }));

        true
    }
}

fn print_request_info(request: &PushRequest) {
    info!("push request:");
    info!("\tname:\t{}", request.filename);
    info!("\tsize:\t{}", request.size);
    info!("\tcid:\t{}", hex::encode(&request.cid));

    if let Some(header) = &request.header {
        info!("\tpeer:\t{}", header.node_id);
        info!("\tsign:\t{}", hex::encode(&header.signature));
        info!("\tpubkey:\t{}", hex::encode(&header.node_pub_key));
    }
}

async fn prompt_accept() -> bool {
    loop {
        info!("do you want to receive this file? [y,n]");

        match read_line().await.as_deref() {
            Ok("y" | "Y") => return true,
            Ok("n" | "N") => return false,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

struct SaveToFile {
    peer_id: PeerId,
    limit: u64,
    path: Utf8PathBuf,
}

#[async_trait]
impl TransferHandler for SaveToFile {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    async fn open_sink(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let file = tokio::fs::File::create(&self.path).await?;
        Ok(Box::new(file))
    }

    async fn transfer_started(&self, updates: ProgressStream) {
        drop(spawn_progress_printer(self.path.to_string(), updates));
    }

    async fn transfer_done(&self, result: &Result<u64, ProtocolError>) {
        match result {
            Ok(received) => info!("received {received} bytes into {}", self.path),
            Err(err) => warn!(%err, "transfer failed"),
        }
    }
}
