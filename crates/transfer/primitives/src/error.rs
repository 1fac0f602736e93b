use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::peer::PeerId;

/// Why a state transfer did not complete.
///
/// Cloneable so the same failure can be delivered to every event subscriber.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum TransferError {
    #[error("stream closed")]
    StreamClosed,
    #[error("transfer interrupted after {bytes_transferred} bytes")]
    Interrupted { bytes_transferred: u64 },
    #[error("state stream ended after {bytes_transferred} bytes without an end marker")]
    Truncated { bytes_transferred: u64 },
    #[error("state provider {provider} departed")]
    ProviderDeparted { provider: PeerId },
    #[error("state requester {requester} departed")]
    RequesterDeparted { requester: PeerId },
    #[error("state provider failed: {reason}")]
    ProviderFailed { reason: String },
    #[error("digest handling failed: {reason}")]
    Digest { reason: String },
    #[error("application state callback failed: {reason}")]
    Application { reason: String },
    #[error("i/o failure: {0}")]
    Io(Arc<io::Error>),
    #[error("message bus failure: {reason}")]
    Bus { reason: String },
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },
    #[error("no state provider available")]
    NoProvider,
    #[error("a state transfer is already in progress")]
    InProgress,
    #[error("state transfer timed out")]
    Timeout,
    #[error("state response carried no rendezvous address")]
    MissingRendezvous,
    #[error("state requester {requester} never connected")]
    RendezvousTimeout { requester: PeerId },
    #[error("state transfer stopped")]
    Stopped,
    #[error("replaced by a newer request from {requester}")]
    Superseded { requester: PeerId },
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl TransferError {
    /// Wraps an application callback failure, keeping the whole error chain.
    #[must_use]
    pub fn application(err: &dyn core::fmt::Display) -> Self {
        Self::Application {
            reason: format!("{err:#}"),
        }
    }
}
