use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use const_format::concatcp;
use eyre::Result as EyreResult;
use strata_transfer_primitives::config::TransportKind;

use crate::defaults;

mod config;
mod init;
mod transfer;

use config::ConfigCommand;
use init::InitCommand;
use transfer::TransferCommand;

pub const EXAMPLES: &str = r"
  # Initialize a member that transfers state in-band
  $ stratad --home data/ init --identity node1

  # Switch an existing member to socket transfers
  $ stratad --home data/ init --identity node1 --transport socket --force

  # Show the whole configuration, or a single key
  $ stratad --home data/ config
  $ stratad --home data/ config state_transfer.socket.max_pool

  # Transfer a file between two in-process members
  $ stratad --home data/ transfer --state snapshot.bin
";

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(after_help = concatcp!(
    "Environment variables:\n",
    "  STRATA_HOME    Directory for config and data\n\n",
    "Examples:",
    EXAMPLES
))]
pub struct RootCommand {
    #[command(flatten)]
    pub args: RootArgs,

    #[command(subcommand)]
    pub action: SubCommands,
}

#[derive(Debug, Subcommand)]
pub enum SubCommands {
    Config(ConfigCommand),
    Init(InitCommand),
    Transfer(TransferCommand),
}

#[derive(Debug, Parser)]
pub struct RootArgs {
    /// Directory for config and data
    #[arg(long, value_name = "PATH", default_value_t = defaults::default_home())]
    #[arg(env = "STRATA_HOME", hide_env_values = true)]
    pub home: Utf8PathBuf,
}

impl RootCommand {
    pub async fn run(self) -> EyreResult<()> {
        match self.action {
            SubCommands::Config(config) => config.run(&self.args),
            SubCommands::Init(init) => init.run(&self.args),
            SubCommands::Transfer(transfer) => transfer.run(&self.args).await,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum TransportArg {
    /// Chunks travel over the message bus
    InBand,
    /// One TCP connection per requester
    Socket,
}

impl From<TransportArg> for TransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::InBand => Self::InBand,
            TransportArg::Socket => Self::Socket,
        }
    }
}
