//! Bounded pool of tasks serving out-of-band connections.
//!
//! There is no queue in front of the workers: a job is accepted only when an
//! idle worker can take it or a new worker may be started. Idle workers
//! retire after the keep-alive period.

use core::future::Future;
use core::pin::Pin;
use core::time::Duration;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

pub(crate) type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    state: Mutex<PoolState>,
}

struct Shared {
    keep_alive: Duration,
    counts: Mutex<Counts>,
    jobs: AsyncMutex<mpsc::UnboundedReceiver<Job>>,
}

#[derive(Default)]
struct Counts {
    workers: usize,
    idle: usize,
    /// Jobs handed to idle workers but not yet picked up.
    queued: usize,
}

struct PoolState {
    max_workers: usize,
    sender: Option<mpsc::UnboundedSender<Job>>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub(crate) fn new(max_workers: usize, keep_alive: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                keep_alive,
                counts: Mutex::new(Counts::default()),
                jobs: AsyncMutex::new(receiver),
            }),
            state: Mutex::new(PoolState {
                max_workers: max_workers.max(1),
                sender: Some(sender),
                tasks: JoinSet::new(),
            }),
        }
    }

    /// Hands `job` to a worker, or gives it back if the pool is saturated or
    /// shut down.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        let mut state = self.state.lock();

        while state.tasks.try_join_next().is_some() {}

        let Some(sender) = state.sender.clone() else {
            return Err(job);
        };

        {
            let mut counts = self.shared.counts.lock();

            if counts.idle > counts.queued {
                counts.queued += 1;
                drop(counts);

                return sender.send(job).map_err(|rejected| {
                    self.shared.counts.lock().queued -= 1;
                    rejected.0
                });
            }

            if counts.workers >= state.max_workers {
                return Err(job);
            }

            counts.workers += 1;
        }

        let shared = Arc::clone(&self.shared);
        let _abort = state.tasks.spawn(run_worker(shared, job));

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn workers(&self) -> usize {
        self.shared.counts.lock().workers
    }

    /// Stops accepting jobs and waits up to `wait` for running ones, aborting
    /// whatever is still running after that.
    pub(crate) async fn shutdown(&self, wait: Duration) {
        let mut tasks = {
            let mut state = self.state.lock();
            state.sender = None;
            core::mem::take(&mut state.tasks)
        };

        let deadline = Instant::now() + wait;

        loop {
            match time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_joined)) => {}
                Ok(None) => break,
                Err(_elapsed) => {
                    warn!(remaining = tasks.len(), "worker pool did not drain in time, aborting");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        debug!("worker pool shut down");
    }
}

async fn run_worker(shared: Arc<Shared>, first: Job) {
    let mut job = first;

    loop {
        job.await;

        shared.counts.lock().idle += 1;

        job = loop {
            let next = time::timeout(shared.keep_alive, async {
                shared.jobs.lock().await.recv().await
            })
            .await;

            match next {
                Ok(Some(job)) => {
                    let mut counts = shared.counts.lock();
                    counts.queued -= 1;
                    counts.idle -= 1;
                    break job;
                }
                Ok(None) => {
                    let mut counts = shared.counts.lock();
                    counts.idle -= 1;
                    counts.workers -= 1;
                    return;
                }
                Err(_elapsed) => {
                    let mut counts = shared.counts.lock();

                    // A job is on its way to some idle worker; stay for it.
                    if counts.queued >= counts.idle {
                        continue;
                    }

                    counts.idle -= 1;
                    counts.workers -= 1;
                    debug!("idle worker retired");
                    return;
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    use super::*;

    fn blocking_job() -> (Job, oneshot::Sender<()>) {
        let (release, wait) = oneshot::channel::<()>();
        let job: Job = Box::pin(async move {
            let _released = wait.await;
        });

        (job, release)
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects() {
        let pool = WorkerPool::new(2, Duration::from_secs(5));

        let (first, release_first) = blocking_job();
        let (second, _release_second) = blocking_job();
        let (third, _release_third) = blocking_job();

        assert!(pool.submit(first).is_ok(), "first worker starts");
        assert!(pool.submit(second).is_ok(), "second worker starts");
        assert!(pool.submit(third).is_err(), "no room for a third");

        release_first.send(()).unwrap();
        sleep(Duration::from_millis(20)).await;

        let (fourth, _release_fourth) = blocking_job();
        assert!(pool.submit(fourth).is_ok(), "an idle worker takes the next job");
        assert_eq!(pool.workers(), 2, "the idle worker was reused");

        pool.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_workers_retire() {
        let pool = WorkerPool::new(3, Duration::from_millis(100));

        let (job, release) = blocking_job();
        assert!(pool.submit(job).is_ok(), "worker starts");
        release.send(()).unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.workers(), 1, "worker idles within keep-alive");

        sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.workers(), 0, "worker retired after keep-alive");
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_jobs() {
        let pool = WorkerPool::new(1, Duration::from_secs(5));
        let (job, _never) = blocking_job();
        assert!(pool.submit(job).is_ok(), "worker starts");

        let started = Instant::now();
        pool.shutdown(Duration::from_millis(100)).await;

        assert!(
            started.elapsed() < Duration::from_secs(1),
            "shutdown is bounded by its wait"
        );

        let (late, _release) = blocking_job();
        assert!(pool.submit(late).is_err(), "no jobs after shutdown");
    }
}
