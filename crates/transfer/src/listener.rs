//! Application callbacks that produce and consume state.

use async_trait::async_trait;
use eyre::Result as EyreResult;

use crate::stream::{StateInput, StateOutput};

/// Streaming access to the application state.
///
/// Errors returned here fail the transfer; a [`TransferError`] returned
/// unchanged (for example from a failed write) is reported as is, anything
/// else is reported as an application failure.
///
/// [`TransferError`]: strata_transfer_primitives::TransferError
#[async_trait]
pub trait StateListener: Send + Sync {
    /// Writes the current state to `output`. The core closes the output once
    /// this returns successfully.
    async fn get_state(&self, output: &mut dyn StateOutput) -> EyreResult<()>;

    /// Replaces the local state with what `input` yields.
    async fn set_state(&self, input: &mut dyn StateInput) -> EyreResult<()>;
}

/// Whole-state access for applications whose state fits in memory.
pub trait SnapshotListener: Send + Sync {
    fn snapshot(&self) -> EyreResult<Vec<u8>>;

    fn restore(&self, state: Vec<u8>) -> EyreResult<()>;
}

/// Adapts a [`SnapshotListener`] to the streaming contract.
#[derive(Debug)]
pub struct Snapshot<L>(pub L);

#[async_trait]
impl<L: SnapshotListener> StateListener for Snapshot<L> {
    async fn get_state(&self, output: &mut dyn StateOutput) -> EyreResult<()> {
        let state = self.0.snapshot()?;
        output.write(&state).await?;

        Ok(())
    }

    async fn set_state(&self, input: &mut dyn StateInput) -> EyreResult<()> {
        let mut state = Vec::new();
        let _read = input.read_to_end(&mut state).await?;

        self.0.restore(state)
    }
}
