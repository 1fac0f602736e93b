use std::fs::create_dir_all;

use clap::Parser;
use eyre::{bail, Result as EyreResult, WrapErr};
use strata_config::ConfigFile;
use strata_transfer_primitives::config::StateTransferConfig;
use strata_transfer_primitives::PeerId;
use tracing::{info, warn};

use super::TransportArg;
use crate::cli::RootArgs;
use crate::defaults::DEFAULT_IDENTITY;

/// Initialize the configuration of a member
#[derive(Debug, Parser)]
pub struct InitCommand {
    /// Name of this member in the group
    #[arg(long, value_name = "NAME", default_value = DEFAULT_IDENTITY)]
    pub identity: String,

    /// How state travels to joining members
    #[arg(long, value_enum, default_value_t = TransportArg::InBand)]
    pub transport: TransportArg,

    /// Largest in-band chunk in bytes
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,

    /// Requesters served at the same time over sockets
    #[arg(long, value_name = "COUNT")]
    pub max_pool: Option<usize>,

    /// Transfer state without closing the delivery barrier
    #[arg(long)]
    pub no_digest: bool,

    /// Overwrite an existing configuration
    #[arg(long, short)]
    pub force: bool,
}

impl InitCommand {
    pub fn run(self, root_args: &RootArgs) -> EyreResult<()> {
        let path = &root_args.home;

        if ConfigFile::exists(path) {
            if !self.force {
                bail!("Member is already initialized in {path:?}, pass --force to overwrite");
            }
            warn!(%path, "Overwriting existing configuration");
        }

        create_dir_all(path).wrap_err_with(|| format!("failed to create directory {path:?}"))?;

        let mut state_transfer = StateTransferConfig::default();
        state_transfer.transport = self.transport.into();
        state_transfer.digest = !self.no_digest;

        if let Some(chunk_size) = self.chunk_size {
            state_transfer.chunk_size = chunk_size;
        }

        if let Some(max_pool) = self.max_pool {
            state_transfer.socket.max_pool = max_pool;
        }

        let config = ConfigFile::new(PeerId::new(self.identity), state_transfer);
        config.save(path)?;

        info!(
            %path,
            identity = %config.identity,
            transport = %config.state_transfer.transport,
            "Initialized member"
        );

        Ok(())
    }
}
