//! Streaming state transfer between members of a group.
//!
//! A joining member asks an existing one for its application state. The
//! provider briefly closes its delivery barrier, captures a digest of what it
//! has delivered, and answers; the state bytes then flow either in-band as
//! chunk messages or out-of-band over a dedicated TCP connection. The
//! requester installs the digest before reading any state, so the state and
//! the messages delivered after it line up.

use core::fmt::{self, Debug, Formatter};
use core::time::Duration;
use std::sync::Arc;

use eyre::Report;
use strata_transfer_primitives::config::StateTransferConfig;
use strata_transfer_primitives::{PeerId, StateMessage, TransferError, TransferEvent};
use tokio::sync::broadcast;

use crate::context::TransferContext;

pub mod barrier;
pub mod bus;
mod context;
pub mod listener;
pub mod local;
pub mod session;
pub mod stats;
pub mod stream;
mod transport;

pub use barrier::BarrierGuard;
pub use bus::{DeliveryLayer, MessageBus};
pub use listener::{Snapshot, SnapshotListener, StateListener};
pub use session::{ProviderState, RequesterState};
pub use stats::TransferStats;
pub use stream::{StateInput, StateOutput};

/// The state-transfer protocol of one member.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct StateTransfer {
    ctx: Arc<TransferContext>,
}

impl StateTransfer {
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        local: PeerId,
        config: StateTransferConfig,
        bus: Arc<dyn MessageBus>,
        delivery: Arc<dyn DeliveryLayer>,
        listener: Arc<dyn StateListener>,
    ) -> Self {
        let ctx = Arc::new_cyclic(|this| {
            TransferContext::new(local, config, bus, delivery, listener, this)
        });

        Self { ctx }
    }

    /// Fetches state from `provider`, or from the first other member of the
    /// current view, and waits until it was applied or the transfer failed.
    ///
    /// # Errors
    ///
    /// Returns error if no provider is available, another fetch is running,
    /// `timeout` elapses, or the transfer itself fails.
    pub async fn fetch_state(
        &self,
        provider: Option<PeerId>,
        timeout: Duration,
    ) -> Result<u64, TransferError> {
        self.ctx.fetch_state(provider, timeout).await
    }

    /// Feeds a state-transfer message received from `sender`.
    pub async fn handle_message(&self, sender: PeerId, message: StateMessage) {
        self.ctx.handle_message(sender, message).await;
    }

    /// Installs a new membership view; sessions with departed members fail.
    pub async fn handle_view_change(&self, members: Vec<PeerId>) {
        self.ctx.handle_view_change(members).await;
    }

    /// Reports a transport fault on the link to `peer`.
    pub async fn handle_exception(&self, peer: &PeerId, error: &Report) {
        self.ctx.handle_exception(peer, error).await;
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.ctx.subscribe()
    }

    #[must_use]
    pub fn requester_state(&self) -> RequesterState {
        self.ctx.requester_state()
    }

    #[must_use]
    pub fn provider_state(&self, requester: &PeerId) -> ProviderState {
        self.ctx.provider_state(requester)
    }

    #[must_use]
    pub fn members(&self) -> Vec<PeerId> {
        self.ctx.members()
    }

    #[must_use]
    pub fn local(&self) -> &PeerId {
        self.ctx.local()
    }

    #[must_use]
    pub fn config(&self) -> &StateTransferConfig {
        self.ctx.config()
    }

    #[must_use]
    pub fn stats(&self) -> &TransferStats {
        self.ctx.stats()
    }

    pub fn reset_stats(&self) {
        self.ctx.stats().reset();
    }

    /// Fails every running session and releases the transport.
    pub async fn stop(&self) {
        self.ctx.stop().await;
    }
}

impl Debug for StateTransfer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTransfer")
            .field("local", self.ctx.local())
            .field("transport", &self.ctx.config().transport)
            .field("requester_state", &self.ctx.requester_state())
            .finish_non_exhaustive()
    }
}
