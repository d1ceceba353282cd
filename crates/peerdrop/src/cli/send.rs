use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::{bail, eyre, Result as EyreResult, WrapErr};
use tokio::fs::File;
use tokio::time::sleep;
use tracing::info;

use peerdrop_protocol::discovery::{DiscoveredPeer, DiscoverySubstrate};
use peerdrop_protocol::progress::{self, TransferProgress};
use peerdrop_protocol::{Node, Transport};

use crate::cli::{read_line, spawn_progress_printer, RootArgs};
use crate::config::Settings;
use crate::content;
use crate::host::Host;

/// Offer a file to a peer discovered on the local network.
#[derive(Debug, Parser)]
pub struct SendCommand {
    /// File to offer
    #[arg(value_name = "FILE")]
    pub file: Utf8PathBuf,

    /// How long to scan for peers before listing them
    #[arg(long, value_name = "SECONDS", default_value_t = 2)]
    pub scan: u64,
}

impl SendCommand {
    pub async fn run(self, root: RootArgs) -> EyreResult<()> {
        let metadata = tokio::fs::metadata(&self.file)
            .await
            .wrap_err_with(|| format!("failed to inspect {}", self.file))?;
        if !metadata.is_file() {
            bail!("{} is not a regular file", self.file);
        }
        let size = metadata.len();
        let filename = self
            .file
            .file_name()
            .ok_or_else(|| eyre!("{} has no file name", self.file))?;

        let settings = Settings::load_or_create(&root.home).await?;
        let keypair = settings.keypair()?;

        let host = Host::start(keypair.clone(), root.port).await?;
        let node = Node::new(
            keypair,
            Arc::clone(&host) as Arc<dyn Transport>,
            Arc::clone(&host) as Arc<dyn DiscoverySubstrate>,
        );
        host.attach_router(node.router());

        info!("Your identity:\n\n\t{}\n", node.peer_id());

        node.start_discovery()?;
        info!("scanning the local network for peers...");
        sleep(Duration::from_secs(self.scan)).await;

        let peers = node.peers();
        node.stop_discovery()?;
        if peers.is_empty() {
            bail!("no peers found in the local network");
        }

        let peer = select_peer(&peers).await?;
        node.connect(peer).await?;

        let cid = content::content_id(&self.file).await?;

        info!("asking {} for confirmation...", peer.peer_id);
        let accepted = node
            .send_push_request(peer.peer_id, filename, i64::try_from(size)?, cid)
            .await?;

        if !accepted {
            info!("rejected!");
            node.close().await?;
            return Ok(());
        }
        info!("accepted!");

        let file = File::open(&self.file)
            .await
            .wrap_err_with(|| format!("failed to open {}", self.file))?;

        let transfer_progress = TransferProgress::new(size);
        let printer = spawn_progress_printer(
            filename.to_owned(),
            progress::watch(&transfer_progress, progress::DEFAULT_TICK_INTERVAL),
        );

        match node
            .transfer(peer.peer_id, file, Arc::clone(&transfer_progress))
            .await
        {
            Ok(sent) => {
                let _ = printer.await;
                info!("successfully sent {sent} bytes");
            }
            Err(err) => {
                printer.abort();
                node.close().await?;
                return Err(err.into());
            }
        }

        node.close().await?;
        Ok(())
    }
}

async fn select_peer(peers: &[DiscoveredPeer]) -> EyreResult<&DiscoveredPeer> {
    if let [only] = peers {
        info!("found one peer: {}", only.peer_id);
        return Ok(only);
    }

    for (index, peer) in peers.iter().enumerate() {
        info!("[{index}] {}", peer.peer_id);
    }

    loop {
        info!("select a peer by index:");
        let line = read_line().await?;

        match line.parse::<usize>() {
            Ok(index) if index < peers.len() => return Ok(&peers[index]),
            _ => info!("not a valid selection"),
        }
    }
}
