use core::fmt::{self, Debug, Display, Formatter};
use core::time::Duration;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Wait applied when [`ResponseCollector::wait_for_all_responses`] is given
/// a zero timeout.
pub const DEFAULT_WAIT: Duration = Duration::from_millis(2000);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CollectorError {
    #[error("response collector needs at least one member")]
    NoMembers,
    #[error("member {member} listed more than once")]
    DuplicateMember { member: String },
}

/// Gathers one result from each member of a fixed set.
///
/// Single-use: build it for one round of requests, wait once, drop it.
pub struct ResponseCollector<K, T> {
    state: Mutex<State<K, T>>,
    cond: Condvar,
}

struct State<K, T> {
    responses: BTreeMap<K, Option<T>>,
    stopped: bool,
}

impl<K: Ord, T> State<K, T> {
    fn complete(&self) -> bool {
        !self.stopped && self.responses.values().all(Option::is_some)
    }
}

impl<K: Ord + Debug, T> ResponseCollector<K, T> {
    pub fn new<I>(members: I) -> Result<Self, CollectorError>
    where
        I: IntoIterator<Item = K>,
    {
        let mut responses = BTreeMap::new();

        for member in members {
            match responses.entry(member) {
                Entry::Vacant(slot) => {
                    let _slot = slot.insert(None);
                }
                Entry::Occupied(slot) => {
                    return Err(CollectorError::DuplicateMember {
                        member: format!("{:?}", slot.key()),
                    })
                }
            }
        }

        if responses.is_empty() {
            return Err(CollectorError::NoMembers);
        }

        Ok(Self {
            state: Mutex::new(State {
                responses,
                stopped: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Records `result` for `member` if it is still expected.
    ///
    /// Returns whether the result was recorded.
    pub fn add(&self, member: &K, result: T) -> bool {
        let mut state = self.state.lock();

        if state.stopped {
            return false;
        }

        let Some(slot) = state.responses.get_mut(member) else {
            return false;
        };

        *slot = Some(result);
        let _woken = self.cond.notify_all();

        true
    }

    /// Stops waiting for `member`; later results from it are ignored.
    pub fn suspect(&self, member: &K) {
        let mut state = self.state.lock();

        if state.stopped {
            return;
        }

        if state.responses.remove(member).is_some() {
            let _woken = self.cond.notify_all();
        }
    }

    #[must_use]
    pub fn has_all_responses(&self) -> bool {
        self.state.lock().complete()
    }

    /// Blocks until every remaining member has responded, the collector is
    /// stopped, or `timeout` elapses. A zero timeout waits [`DEFAULT_WAIT`].
    pub fn wait_for_all_responses(&self, timeout: Duration) -> bool {
        let timeout = if timeout.is_zero() {
            DEFAULT_WAIT
        } else {
            timeout
        };
        let deadline = Instant::now() + timeout;

        let mut state = self.state.lock();

        loop {
            if state.stopped {
                return false;
            }

            if state.complete() {
                return true;
            }

            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.complete();
            }
        }
    }

    /// Makes the collector inert, dropping results and releasing waiters.
    pub fn stop(&self) {
        let mut state = self.state.lock();

        state.stopped = true;
        state.responses.values_mut().for_each(|slot| *slot = None);

        let _woken = self.cond.notify_all();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Number of members still expected.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().responses.len()
    }

    #[must_use]
    pub fn results(&self) -> BTreeMap<K, Option<T>>
    where
        K: Clone,
        T: Clone,
    {
        self.state.lock().responses.clone()
    }
}

impl<K, T> Debug for ResponseCollector<K, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCollector").finish_non_exhaustive()
    }
}

impl<K: Ord + Debug, T: Debug> Display for ResponseCollector<K, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(f, "{:?}, complete={}", state.responses, state.complete())
    }
}
