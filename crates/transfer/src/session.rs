use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use strata_transfer_primitives::{PeerId, TransferError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::barrier::BarrierGuard;

/// Progress of the local member's own state request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequesterState {
    #[default]
    Idle,
    AwaitingProviderAddress,
    Receiving,
    Completed,
    Failed,
}

/// Progress of one state request the local member is serving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProviderState {
    #[default]
    Idle,
    BarrierClosing,
    Providing,
    Completed,
    Failed,
}

/// Byte count and close flag of one stream endpoint.
#[derive(Debug, Default)]
pub(crate) struct SessionMeter {
    bytes: AtomicU64,
    closed: AtomicBool,
}

impl SessionMeter {
    pub(crate) fn record(&self, bytes: usize) -> u64 {
        let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
        self.bytes.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Returns `true` for the single caller that closes the endpoint.
    pub(crate) fn close_once(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What a transport needs to know about the session it serves.
#[derive(Clone, Debug)]
pub(crate) struct SessionHandle {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    pub(crate) meter: Arc<SessionMeter>,
    pub(crate) started: Instant,
}

impl SessionHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
            meter: Arc::default(),
            started: Instant::now(),
        }
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Fails once the endpoint was closed or the session cancelled.
    pub(crate) fn ensure_writable(&self) -> Result<(), TransferError> {
        if self.meter.is_closed() {
            return Err(TransferError::StreamClosed);
        }

        if self.cancel.is_cancelled() {
            return Err(self.interrupted());
        }

        Ok(())
    }

    pub(crate) fn interrupted(&self) -> TransferError {
        TransferError::Interrupted {
            bytes_transferred: self.meter.bytes(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ProviderSession {
    pub(crate) handle: SessionHandle,
    pub(crate) state: ProviderState,
}

#[derive(Debug)]
pub(crate) struct RequesterSession {
    pub(crate) provider: PeerId,
    pub(crate) state: RequesterState,
    pub(crate) handle: SessionHandle,
    pub(crate) barrier: Option<BarrierGuard>,
    pub(crate) done: Option<oneshot::Sender<Result<u64, TransferError>>>,
}
