use core::sync::atomic::{AtomicU64, Ordering};

/// Provider-side counters, shared by every session of one member.
#[derive(Debug, Default)]
pub struct TransferStats {
    requests: AtomicU64,
    bytes_sent: AtomicU64,
}

impl TransferStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_request(&self) {
        let _prev = self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes(&self, bytes: u64) {
        let _prev = self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn num_state_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn num_bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn average_state_size(&self) -> f64 {
        average(self.num_bytes_sent(), self.num_state_requests())
    }

    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
    }
}

#[expect(clippy::cast_precision_loss, reason = "statistics tolerate rounding")]
fn average(bytes: u64, requests: u64) -> f64 {
    if requests == 0 {
        return 0.0;
    }

    bytes as f64 / requests as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_is_bytes_over_requests() {
        let stats = TransferStats::new();
        assert!(stats.average_state_size().abs() < f64::EPSILON, "no requests yet");

        stats.record_request();
        stats.record_request();
        stats.record_bytes(300);
        stats.record_bytes(100);

        assert!(
            (stats.average_state_size() - 200.0).abs() < f64::EPSILON,
            "400 bytes over 2 requests"
        );

        stats.reset();
        assert_eq!(stats.num_state_requests(), 0, "reset clears requests");
        assert_eq!(stats.num_bytes_sent(), 0, "reset clears bytes");
    }
}
