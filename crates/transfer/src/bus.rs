//! Collaborators the state transfer consumes but does not own.

use async_trait::async_trait;
use eyre::Result as EyreResult;
use strata_transfer_primitives::{Digest, PeerId, StateMessage};

/// Addressed delivery of state-transfer messages to other members.
///
/// Messages sent to the same destination must arrive in the order they were
/// sent; in-band transfers rely on it to reassemble state.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Sends `message` to `to`.
    ///
    /// # Errors
    ///
    /// Returns error if the destination is unreachable or the message could
    /// not be encoded.
    async fn send(&self, to: &PeerId, message: StateMessage) -> EyreResult<()>;
}

/// The delivery protocol underneath the state transfer.
///
/// While the barrier is closed ordinary traffic is drained and held back, so a
/// digest captured in that window describes a consistent cut.
pub trait DeliveryLayer: Send + Sync {
    fn close_barrier(&self);

    fn open_barrier(&self);

    fn capture_digest(&self) -> EyreResult<Digest>;

    /// Replaces the local digest with the provider's.
    fn install_digest(&self, digest: Digest) -> EyreResult<()>;
}
