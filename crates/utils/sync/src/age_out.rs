//! A set of keys that forget themselves unless refreshed.
//!
//! Every [`AgeOutCache::add`] schedules a timer on the runtime the cache was
//! created on. When the timer fires, the expiry handler (if any) runs with the
//! key and the entry is then dropped. Explicit removal and expiry race
//! through a per-entry claim flag: whichever claims the entry first wins, so a
//! removed key never reaches the handler once removal has claimed it.

use core::fmt::{self, Debug, Display, Formatter};
use core::hash::Hash;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

pub type ExpiryHandler<K> = Arc<dyn Fn(&K) + Send + Sync>;

pub struct AgeOutCache<K: Eq + Hash> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    timeout: Duration,
    entries: DashMap<K, Scheduled>,
    handler: RwLock<Option<ExpiryHandler<K>>>,
    next_id: AtomicU64,
    runtime: Handle,
}

struct Scheduled {
    id: u64,
    deadline: Instant,
    claimed: AtomicBool,
    task: JoinHandle<()>,
}

impl Scheduled {
    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }
}

impl<K> AgeOutCache<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Creates an empty cache whose entries expire `timeout` after insertion.
    ///
    /// Must be called from within a tokio runtime; timers are spawned on it.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_runtime(Handle::current(), timeout)
    }

    #[must_use]
    pub fn with_runtime(runtime: Handle, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                timeout,
                entries: DashMap::new(),
                handler: RwLock::new(None),
                next_id: AtomicU64::new(0),
                runtime,
            }),
        }
    }

    #[must_use]
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&K) + Send + Sync + 'static,
    {
        self.set_handler(Some(Arc::new(handler)));
        self
    }

    /// Installs or clears the expiry handler. Timers already scheduled pick
    /// up the new handler when they fire.
    pub fn set_handler(&self, handler: Option<ExpiryHandler<K>>) {
        *self.inner.handler.write() = handler;
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Schedules `key` to expire after the cache timeout, replacing any
    /// schedule the key already had.
    pub fn add(&self, key: K) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.inner.timeout;

        // The shard lock is held until the entry is in place, so a timer
        // cannot look for its entry before it exists.
        let slot = self.inner.entries.entry(key.clone());

        let weak = Arc::downgrade(&self.inner);
        let task = self.inner.runtime.spawn(async move {
            sleep_until(deadline).await;

            if let Some(inner) = Weak::upgrade(&weak) {
                inner.expire(&key, id);
            }
        });

        let scheduled = Scheduled {
            id,
            deadline,
            claimed: AtomicBool::new(false),
            task,
        };

        match slot {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(scheduled);
                if previous.claim() {
                    previous.task.abort();
                }
            }
            Entry::Vacant(vacant) => {
                let _ignored = vacant.insert(scheduled);
            }
        }
    }

    /// Cancels the schedule for `key`. Returns whether the key was live.
    pub fn remove(&self, key: &K) -> bool {
        let Some((_, scheduled)) = self.inner.entries.remove(key) else {
            return false;
        };

        if scheduled.claim() {
            scheduled.task.abort();
            return true;
        }

        false
    }

    pub fn remove_all<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        for key in keys {
            let _removed = self.remove(key);
        }
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Number of entries that have neither expired nor been removed.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.entries.len()
    }
}

impl<K> Inner<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn expire(&self, key: &K, id: u64) {
        let won = self
            .entries
            .get(key)
            .is_some_and(|scheduled| scheduled.id == id && scheduled.claim());

        if !won {
            return;
        }

        debug!(?key, "entry aged out");

        let handler = self.handler.read().clone();

        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(key))).is_err() {
                warn!(?key, "expiry handler panicked");
            }
        }

        let _removed = self.entries.remove_if(key, |_, scheduled| scheduled.id == id);
    }
}

impl<K: Eq + Hash> Drop for AgeOutCache<K> {
    fn drop(&mut self) {
        for entry in self.inner.entries.iter() {
            entry.task.abort();
        }
    }
}

impl<K: Eq + Hash> Debug for AgeOutCache<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgeOutCache")
            .field("timeout", &self.inner.timeout)
            .field("size", &self.inner.entries.len())
            .finish_non_exhaustive()
    }
}

impl<K: Display + Eq + Hash> Display for AgeOutCache<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let now = Instant::now();

        for entry in self.inner.entries.iter() {
            let remaining = entry.deadline.saturating_duration_since(now);

            if remaining.is_zero() {
                writeln!(f, "{}: expired", entry.key())?;
            } else {
                writeln!(f, "{}: {} ms", entry.key(), remaining.as_millis())?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::time::sleep;

    use super::*;

    fn recording_cache(timeout: Duration) -> (AgeOutCache<u32>, Arc<Mutex<Vec<u32>>>) {
        let expired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&expired);
        let cache = AgeOutCache::new(timeout).with_handler(move |key: &u32| sink.lock().push(*key));

        (cache, expired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire_after_timeout() {
        let (cache, expired) = recording_cache(Duration::from_millis(1000));

        for key in 1..=5 {
            cache.add(key);
        }
        assert_eq!(cache.size(), 5, "all keys should be live");

        sleep(Duration::from_millis(500)).await;
        assert_eq!(cache.size(), 5, "nothing expires before the timeout");

        sleep(Duration::from_millis(800)).await;
        assert_eq!(cache.size(), 0, "every key expires after the timeout");

        let mut fired = expired.lock().clone();
        fired.sort_unstable();
        assert_eq!(fired, [1, 2, 3, 4, 5], "handler fires once per key");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gradual_expiry() {
        let (cache, expired) = recording_cache(Duration::from_millis(1000));

        cache.add(1);
        sleep(Duration::from_millis(500)).await;
        cache.add(2);
        sleep(Duration::from_millis(700)).await;

        assert_eq!(cache.size(), 1, "only the first key has expired");
        assert!(cache.contains(&2), "second key is still live");
        assert_eq!(*expired.lock(), [1], "handler saw the first key only");
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_key_never_fires() {
        let (cache, expired) = recording_cache(Duration::from_millis(1000));

        cache.add(7);
        cache.add(8);
        cache.remove_all(&[7, 8]);
        assert!(!cache.remove(&7), "second removal is a no-op");

        sleep(Duration::from_millis(1500)).await;

        assert_eq!(cache.size(), 0, "removed keys are gone");
        assert!(expired.lock().is_empty(), "handler must not see removed keys");
    }

    #[tokio::test(start_paused = true)]
    async fn test_readd_resets_expiry() {
        let (cache, expired) = recording_cache(Duration::from_millis(1000));

        cache.add(1);
        sleep(Duration::from_millis(800)).await;
        cache.add(1);
        sleep(Duration::from_millis(800)).await;

        assert!(cache.contains(&1), "refreshed key outlives its first deadline");
        assert!(expired.lock().is_empty(), "stale schedule must not fire");

        sleep(Duration::from_millis(300)).await;

        assert!(!cache.contains(&1), "refreshed key expires a full timeout later");
        assert_eq!(*expired.lock(), [1], "handler fires exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_does_not_block_cleanup() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cache = AgeOutCache::new(Duration::from_millis(100)).with_handler(move |key: &u32| {
            sink.lock().push(*key);
            assert!(*key != 1, "handler rejects key 1");
        });

        cache.add(1);
        cache.add(2);
        sleep(Duration::from_millis(200)).await;

        assert_eq!(cache.size(), 0, "both entries are cleaned up");
        assert_eq!(seen.lock().len(), 2, "the panic did not affect the other key");
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_shows_remaining_time() {
        let cache = AgeOutCache::new(Duration::from_millis(1000));

        cache.add("node-1".to_owned());
        sleep(Duration::from_millis(250)).await;

        assert_eq!(cache.to_string(), "node-1: 750 ms\n", "remaining time is rendered");
    }
}
