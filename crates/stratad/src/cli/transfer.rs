use core::time::Duration;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::{bail, Result as EyreResult, WrapErr};
use parking_lot::Mutex;
use strata_config::ConfigFile;
use strata_transfer::local::{spawn_delivery, LocalDelivery, LocalNetwork};
use strata_transfer::{Snapshot, SnapshotListener, StateTransfer};
use strata_transfer_primitives::config::StateTransferConfig;
use strata_transfer_primitives::{Digest, PeerId, SeqRange};
use tokio::fs::{read, write};
use tokio::time::Instant;
use tracing::info;

use super::TransportArg;
use crate::cli::RootArgs;

/// Transfer a state file from this member to a joining in-process member
#[derive(Debug, Parser)]
pub struct TransferCommand {
    /// File holding the state to transfer
    #[arg(long, value_name = "PATH")]
    pub state: Utf8PathBuf,

    /// Override the configured transport
    #[arg(long, value_enum)]
    pub transport: Option<TransportArg>,

    /// Give up after this many milliseconds
    #[arg(long, value_name = "MS", default_value_t = 20_000)]
    pub timeout_ms: u64,

    /// Write the received state here
    #[arg(long, value_name = "PATH")]
    pub output: Option<Utf8PathBuf>,
}

/// State served from memory.
struct StaticState(Vec<u8>);

impl SnapshotListener for StaticState {
    fn snapshot(&self) -> EyreResult<Vec<u8>> {
        Ok(self.0.clone())
    }

    fn restore(&self, _state: Vec<u8>) -> EyreResult<()> {
        bail!("the providing member does not accept state")
    }
}

/// Keeps whatever state it is handed.
struct Received(Arc<Mutex<Vec<u8>>>);

impl SnapshotListener for Received {
    fn snapshot(&self) -> EyreResult<Vec<u8>> {
        Ok(self.0.lock().clone())
    }

    fn restore(&self, state: Vec<u8>) -> EyreResult<()> {
        *self.0.lock() = state;
        Ok(())
    }
}

impl TransferCommand {
    pub async fn run(self, root_args: &RootArgs) -> EyreResult<()> {
        let path = &root_args.home;

        if !ConfigFile::exists(path) {
            bail!("Member is not initialized in {path:?}");
        }

        let config = ConfigFile::load(path)?;

        let mut transfer_config = config.state_transfer.clone();
        if let Some(transport) = self.transport {
            transfer_config.transport = transport.into();
        }

        let state = read(&self.state)
            .await
            .wrap_err_with(|| format!("failed to read state from {:?}", self.state))?;

        let provider_id = config.identity.clone();
        let requester_id = PeerId::from(format!("{provider_id}-joiner"));

        let network = LocalNetwork::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let provider = start_member(
            &network,
            provider_id.clone(),
            transfer_config.clone(),
            Snapshot(StaticState(state)),
        );
        let requester = start_member(
            &network,
            requester_id.clone(),
            transfer_config,
            Snapshot(Received(Arc::clone(&received))),
        );

        let view = network.members();
        provider.handle_view_change(view.clone()).await;
        requester.handle_view_change(view).await;

        info!(
            provider = %provider_id,
            requester = %requester_id,
            transport = %provider.config().transport,
            "Starting state transfer"
        );

        let started = Instant::now();
        let outcome = requester
            .fetch_state(Some(provider_id), Duration::from_millis(self.timeout_ms))
            .await;
        let elapsed = started.elapsed();

        let stats = provider.stats();
        let summary = (
            stats.num_state_requests(),
            stats.num_bytes_sent(),
            stats.average_state_size(),
        );

        requester.stop().await;
        provider.stop().await;

        let bytes = outcome.wrap_err("state transfer failed")?;
        let (requests, bytes_sent, average) = summary;

        info!(
            bytes,
            elapsed_ms = elapsed.as_millis(),
            requests,
            bytes_sent,
            average,
            "State transfer completed"
        );

        if let Some(output) = self.output {
            let state = received.lock().clone();
            write(&output, state)
                .await
                .wrap_err_with(|| format!("failed to write state to {output:?}"))?;
            info!(%output, "Wrote received state");
        }

        Ok(())
    }
}

fn start_member<L>(
    network: &Arc<LocalNetwork>,
    id: PeerId,
    config: StateTransferConfig,
    listener: Snapshot<L>,
) -> StateTransfer
where
    L: SnapshotListener + 'static,
{
    let (bus, inbox) = network.join(id.clone());
    let digest = Digest::new().with(id.clone(), SeqRange::new(1, 1, 2));

    let transfer = StateTransfer::new(
        id,
        config,
        Arc::new(bus),
        Arc::new(LocalDelivery::new(digest)),
        Arc::new(listener),
    );

    drop(spawn_delivery(transfer.clone(), inbox));

    transfer
}
