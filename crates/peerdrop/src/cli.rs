use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::Result as EyreResult;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::info;

use peerdrop_protocol::transfer::ProgressStream;

use crate::defaults;

mod receive;
mod send;

use receive::ReceiveCommand;
use send::SendCommand;

pub const EXAMPLES: &str = r"
  # Wait for a peer to push a file into the current directory
  $ peerdrop receive

  # Send a file to a peer discovered on the local network
  $ peerdrop send picture.jpg
";

#[derive(Debug, Parser)]
#[command(author, version, about = "A peer-to-peer file drop for the local network")]
#[command(after_help = EXAMPLES)]
pub struct RootCommand {
    #[command(flatten)]
    pub args: RootArgs,

    #[command(subcommand)]
    pub action: SubCommands,
}

#[derive(Debug, Subcommand)]
pub enum SubCommands {
    #[command(alias = "s")]
    Send(SendCommand),
    #[command(alias = "r")]
    Receive(ReceiveCommand),
}

#[derive(Debug, Parser)]
pub struct RootArgs {
    /// Directory for config and data
    #[arg(long, value_name = "PATH", default_value_t = defaults::default_home())]
    #[arg(env = "PEERDROP_HOME", hide_env_values = true)]
    pub home: Utf8PathBuf,

    /// Port at which other peers can reach this node
    #[arg(short, long, default_value_t = defaults::DEFAULT_PORT)]
    #[arg(env = "PEERDROP_PORT")]
    pub port: u16,
}

impl RootCommand {
    pub async fn run(self) -> EyreResult<()> {
        match self.action {
            SubCommands::Send(send) => send.run(self.args).await,
            SubCommands::Receive(receive) => receive.run(self.args).await,
        }
    }
}

/// Reads one trimmed line from stdin.
pub(crate) async fn read_line() -> EyreResult<String> {
    let mut line = String::new();
    let _ = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().to_owned())
}

/// Logs snapshots of a running transfer until its stream ends.
pub(crate) fn spawn_progress_printer(label: String, mut updates: ProgressStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(snapshot) = updates.next().await {
            match snapshot.remaining() {
                Some(remaining) => info!(
                    "{label}: {:.1}% ({} of {} bytes, ~{}s left)",
                    snapshot.percent(),
                    snapshot.transferred,
                    snapshot.size,
                    remaining.as_secs(),
                ),
                None => info!(
                    "{label}: {:.1}% ({} of {} bytes)",
                    snapshot.percent(),
                    snapshot.transferred,
                    snapshot.size,
                ),
            }
        }
    })
}
