//! The two ways state bytes travel from provider to requester.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use strata_transfer_primitives::{PeerId, Rendezvous, TransferError};
use tracing::debug;

use crate::context::TransferContext;
use crate::session::SessionHandle;
use crate::stream::{StateInput, StateOutput};

pub(crate) mod chunked;
pub(crate) mod pool;
pub(crate) mod socket;

/// What the provider does after answering a request.
pub(crate) enum ProviderHandoff {
    /// Write state into this output right away.
    Output(Box<dyn StateOutput>),
    /// Wait for the requester to connect to this address.
    Rendezvous(SocketAddr),
}

/// What the requester does after the provider answered.
pub(crate) enum RequesterHandoff {
    /// Read state from this input right away.
    Input(Box<dyn StateInput>),
    /// Connect to the provider first, off the delivery path.
    Connect(Rendezvous),
}

#[async_trait]
pub(crate) trait StateTransport: Send + Sync {
    async fn prepare_provider_side(
        &self,
        ctx: &Arc<TransferContext>,
        requester: &PeerId,
        handle: &SessionHandle,
    ) -> Result<ProviderHandoff, TransferError>;

    /// Runs on the delivery path, before any later message from `provider`
    /// is handled.
    fn prepare_requester_side(
        &self,
        provider: &PeerId,
        rendezvous: Option<Rendezvous>,
        handle: &SessionHandle,
    ) -> Result<RequesterHandoff, TransferError>;

    /// Opens the input for a [`RequesterHandoff::Connect`].
    async fn connect_requester_side(
        &self,
        _ctx: &Arc<TransferContext>,
        provider: &PeerId,
        rendezvous: Rendezvous,
        _handle: &SessionHandle,
    ) -> Result<Box<dyn StateInput>, TransferError> {
        Err(TransferError::Protocol {
            reason: format!("{provider} sent rendezvous {rendezvous} for an in-band transfer"),
        })
    }

    async fn on_chunk(&self, provider: &PeerId, payload: Vec<u8>) {
        debug!(%provider, len = payload.len(), "ignoring state chunk");
    }

    async fn on_eof(&self, provider: &PeerId) {
        debug!(%provider, "ignoring end of state");
    }

    /// Tears down whatever still feeds the requester's input.
    fn release_requester_side(&self, _provider: &PeerId, _reason: Option<&TransferError>) {}

    /// Forgets a provider session that will not be served.
    fn release_provider_side(&self, _requester: &PeerId) {}

    async fn stop(&self) {}
}
