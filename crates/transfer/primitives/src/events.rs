use crate::error::TransferError;
use crate::peer::PeerId;

/// Lifecycle notifications surfaced to the application.
///
/// `*Closed` events carry the number of state bytes moved on success.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum TransferEvent {
    InputStreamReady {
        provider: PeerId,
    },
    InputStreamClosed {
        provider: PeerId,
        result: Result<u64, TransferError>,
    },
    OutputStreamReady {
        requester: PeerId,
    },
    OutputStreamClosed {
        requester: PeerId,
        result: Result<u64, TransferError>,
    },
}

impl TransferEvent {
    #[must_use]
    pub const fn peer(&self) -> &PeerId {
        match self {
            Self::InputStreamReady { provider } | Self::InputStreamClosed { provider, .. } => {
                provider
            }
            Self::OutputStreamReady { requester } | Self::OutputStreamClosed { requester, .. } => {
                requester
            }
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::InputStreamClosed { .. } | Self::OutputStreamClosed { .. }
        )
    }
}
