//! Byte streams handed to the application while state is moving.

use async_trait::async_trait;
use strata_transfer_primitives::TransferError;

const READ_CHUNK: usize = 8 * 1024;

/// Where a provider writes its state.
///
/// Closing the output is the end-of-data signal; dropping it without a close
/// makes the requester fail the transfer.
#[async_trait]
pub trait StateOutput: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<(), TransferError>;

    async fn flush(&mut self) -> Result<(), TransferError>;

    /// Flushes and ends the stream. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransferError>;

    fn bytes_written(&self) -> u64;
}

/// Where a requester reads the provider's state from.
#[async_trait]
pub trait StateInput: Send {
    /// Reads up to `buf.len()` bytes; `Ok(0)` is the clean end of state.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError>;

    /// Releases the underlying transport. Closing twice is a no-op.
    async fn close(&mut self);

    fn bytes_read(&self) -> u64;

    /// Appends everything up to the end of state to `out`.
    async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, TransferError> {
        let mut buf = vec![0_u8; READ_CHUNK];
        let mut total = 0;

        loop {
            let read = self.read(&mut buf).await?;
            if read == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..read]);
            total += read;
        }
    }
}
