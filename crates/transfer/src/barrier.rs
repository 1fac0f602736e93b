use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::bus::DeliveryLayer;

/// A closed delivery barrier.
///
/// The barrier is reopened exactly once, either through [`reopen`] or when
/// the guard is dropped.
///
/// [`reopen`]: BarrierGuard::reopen
pub struct BarrierGuard {
    delivery: Arc<dyn DeliveryLayer>,
    reopened: AtomicBool,
}

impl BarrierGuard {
    #[must_use]
    pub fn close(delivery: Arc<dyn DeliveryLayer>) -> Self {
        delivery.close_barrier();
        debug!("delivery barrier closed");

        Self {
            delivery,
            reopened: AtomicBool::new(false),
        }
    }

    /// Returns whether this call reopened the barrier.
    pub fn reopen(&self) -> bool {
        if self.reopened.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.delivery.open_barrier();
        debug!("delivery barrier reopened");

        true
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.reopened.load(Ordering::Acquire)
    }
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        let _reopened = self.reopen();
    }
}

impl Debug for BarrierGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierGuard")
            .field("reopened", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicUsize;

    use eyre::Result as EyreResult;
    use strata_transfer_primitives::Digest;

    use super::*;

    #[derive(Default)]
    struct Counting {
        closes: AtomicUsize,
        opens: AtomicUsize,
    }

    impl DeliveryLayer for Counting {
        fn close_barrier(&self) {
            let _prev = self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn open_barrier(&self) {
            let _prev = self.opens.fetch_add(1, Ordering::SeqCst);
        }

        fn capture_digest(&self) -> EyreResult<Digest> {
            Ok(Digest::new())
        }

        fn install_digest(&self, _digest: Digest) -> EyreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_reopen_happens_once() {
        let delivery = Arc::new(Counting::default());
        let layer: Arc<dyn DeliveryLayer> = delivery.clone();
        let guard = BarrierGuard::close(layer);

        assert!(guard.reopen(), "first reopen opens the barrier");
        assert!(!guard.reopen(), "second reopen is harmless");
        drop(guard);

        assert_eq!(delivery.closes.load(Ordering::SeqCst), 1, "closed once");
        assert_eq!(delivery.opens.load(Ordering::SeqCst), 1, "opened once");
    }

    #[test]
    fn test_drop_reopens() {
        let delivery = Arc::new(Counting::default());
        let layer: Arc<dyn DeliveryLayer> = delivery.clone();

        {
            let _guard = BarrierGuard::close(layer);
            assert_eq!(delivery.opens.load(Ordering::SeqCst), 0, "still closed in scope");
        }

        assert_eq!(delivery.opens.load(Ordering::SeqCst), 1, "leaving scope reopens");
    }
}
