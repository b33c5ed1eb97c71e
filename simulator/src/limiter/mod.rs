//! Rate limited creation producers.
//!
//! A [`RateLimiter`] wakes at a fixed frequency and asks its [`Executor`] to
//! perform up to `requests` creations per tick, until an optional cap on the
//! total number of executions is reached. Failures are counted and published
//! on a bounded error stream; progress is observable through consistent
//! [`Metrics`] snapshots.

mod error;
mod executor;
mod metrics;

pub use error::CreateError;
pub use executor::Executor;
pub use metrics::Metrics;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error emission awaits buffer space, so an undrained stream eventually
/// blocks the tick handler. Consumers are required to drain.
const ERROR_BUFFER: usize = 16;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Creates items at a bounded rate through an [`Executor`].
///
/// The producer moves `idle → running → stopped`; `stopped` is terminal for
/// the instance. All configuration is fixed at construction.
pub struct RateLimiter<E> {
    interval: Duration,
    requests: u32,
    limit: u32,
    executor: E,
    state: AtomicU8,
    metrics: RwLock<Metrics>,
    errors_tx: mpsc::Sender<CreateError>,
    errors_rx: Mutex<Option<mpsc::Receiver<CreateError>>>,
}

impl<E> RateLimiter<E>
where
    E: Executor,
{
    /// Create a producer that wakes every `frequency` and performs up to
    /// `requests` creations per tick, stopping once `limit` items have been
    /// executed. A `limit` of `0` disables the cap.
    pub fn new(frequency: Duration, requests: u32, limit: u32, executor: E) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);
        Self {
            interval: frequency,
            requests,
            limit,
            executor,
            state: AtomicU8::new(IDLE),
            metrics: RwLock::new(Metrics::default()),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// Drive the tick loop until the producer stops.
    ///
    /// Returns once the limit is reached, [`stop`](Self::stop) is called or
    /// `shutdown` fires. A tick handler runs to completion before the next
    /// tick is honored; missed ticks are skipped, so a batch that overruns
    /// the frequency never builds a backlog.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        info!(executor = self.executor.identifier(), "starting rate limiter");
        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while self.is_running() {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.stop();
                }
                _ = ticker.tick() => {
                    self.tick(&shutdown).await;
                }
            }
        }
    }

    /// Mark the producer stopped; the tick loop observes this and exits at
    /// its next iteration. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.state.swap(STOPPED, Ordering::SeqCst) != STOPPED {
            info!(executor = self.executor.identifier(), "stopping rate limiter");
        }
    }

    /// Whether the producer is currently running.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Take the receiving half of the error stream.
    ///
    /// Returns `None` after the first call. The stream must be drained while
    /// the producer runs; failures carried on it are diagnostic only and are
    /// additionally reflected in the counters.
    pub fn errors(&self) -> Option<mpsc::Receiver<CreateError>> {
        self.errors_rx
            .lock()
            .expect("should be able to acquire lock")
            .take()
    }

    /// Consistent snapshot of the creation counters.
    pub async fn metrics(&self) -> Metrics {
        *self.metrics.read().await
    }

    // One wakeup: clamp the batch to the remaining budget, run it through the
    // executor and fold the results into the counters. The write guard is
    // held for the whole batch, which is what keeps snapshots consistent.
    async fn tick(&self, shutdown: &CancellationToken) {
        let mut metrics = self.metrics.write().await;
        if self.limit > 0 && metrics.executed >= self.limit {
            info!(
                executor = self.executor.identifier(),
                executed = metrics.executed,
                limit = self.limit,
                "maximum number of processed work items has been reached"
            );
            self.stop();
            return;
        }
        let batch = if self.limit == 0 {
            self.requests
        } else {
            self.requests.min(self.limit - metrics.executed)
        };
        debug!(
            executor = self.executor.identifier(),
            batch,
            executed = metrics.executed,
            "processing work items"
        );
        let (mut executed, mut succeeded, mut failed) = (0, 0, 0);
        for _ in 0..batch {
            if shutdown.is_cancelled() {
                break;
            }
            executed += 1;
            match AssertUnwindSafe(self.executor.execute()).catch_unwind().await {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(err)) => {
                    failed += 1;
                    if self.errors_tx.send(err).await.is_err() {
                        // Receiver dropped; the failure is still counted.
                        warn!(
                            executor = self.executor.identifier(),
                            "error stream closed"
                        );
                    }
                }
                // A panicking executor costs its item, not the producer.
                Err(_) => {
                    failed += 1;
                    warn!(
                        executor = self.executor.identifier(),
                        "executor panicked while executing a work item"
                    );
                }
            }
        }
        metrics.add(executed, succeeded, failed);
    }
}
