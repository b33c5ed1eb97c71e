//! Live progress rendering for a running simulation.
//!
//! The reporter is a pure consumer of metrics snapshots: it periodically
//! samples the producers through a [`MetricsWatcher`], advances one progress
//! bar per capped stream by the sample delta and signals completion once
//! every capped stream has executed its limit.

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::oneshot;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::limiter::Metrics;
use crate::manager::{CreationMetrics, MetricsWatcher};

/// Per-stream caps, used for bar totals and the completion check.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    /// Node creation cap; `0` renders no bar.
    pub nodes: u32,
    /// Pod creation cap; `0` renders no bar.
    pub pods: u32,
    /// Job creation cap; `0` renders no bar.
    pub jobs: u32,
}

/// Renders creation progress until the run completes or is cancelled.
pub struct ProgressReporter {
    watcher: MetricsWatcher,
    limits: Limits,
    interval: Duration,
    on_finished: Option<oneshot::Sender<()>>,
}

impl ProgressReporter {
    /// Reporter sampling `watcher` every `interval`.
    pub fn new(watcher: MetricsWatcher, limits: Limits, interval: Duration) -> Self {
        Self {
            watcher,
            limits,
            interval,
            on_finished: None,
        }
    }

    /// Signal `tx` exactly once when every capped stream reaches its limit.
    pub fn on_finished(mut self, tx: oneshot::Sender<()>) -> Self {
        self.on_finished = Some(tx);
        self
    }

    /// Sample and render until completion or until `shutdown` fires.
    ///
    /// An unbounded stream (limit `0`) is trivially complete, so a run where
    /// every stream is unbounded finishes after the first sample even though
    /// its producers keep running.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let progress = MultiProgress::new();
        let node_bar = new_limit_bar(&progress, "nodes", self.limits.nodes);
        let pod_bar = new_limit_bar(&progress, "pods", self.limits.pods);
        let job_bar = new_limit_bar(&progress, "jobs", self.limits.jobs);

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut previous = self.watcher.snapshot().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let current = self.watcher.snapshot().await;
                    advance(&node_bar, &current.nodes, &previous.nodes);
                    advance(&pod_bar, &current.pods, &previous.pods);
                    advance(&job_bar, &current.jobs, &previous.jobs);
                    debug!(
                        nodes = %current.nodes,
                        pods = %current.pods,
                        jobs = %current.jobs,
                        "sampled creation metrics"
                    );
                    previous = current;
                    if finished(&self.limits, &current) {
                        if let Some(tx) = self.on_finished.take() {
                            let _ = tx.send(());
                        }
                        break;
                    }
                }
            }
        }
        for bar in [node_bar, pod_bar, job_bar].into_iter().flatten() {
            bar.finish();
        }
    }
}

fn new_limit_bar(progress: &MultiProgress, name: &'static str, limit: u32) -> Option<ProgressBar> {
    if limit == 0 {
        return None;
    }
    let bar = progress.add(ProgressBar::new(u64::from(limit)));
    bar.set_prefix(name);
    bar.set_style(
        ProgressStyle::with_template(
            "{prefix:>5} [{bar:40}] {pos}/{len} {msg}",
        )
        .expect("progress bar template should parse")
        .progress_chars("=> "),
    );
    Some(bar)
}

// Bars advance by completed work, successful or not; `executed` never passes
// the limit so neither does the bar.
fn advance(bar: &Option<ProgressBar>, current: &Metrics, previous: &Metrics) {
    if let Some(bar) = bar {
        let delta = current.delta(previous);
        bar.inc(u64::from(delta.succeeded + delta.failed));
        bar.set_message(format!(
            "executed {} succeeded {} failed {}",
            current.executed, current.succeeded, current.failed
        ));
    }
}

// Every capped stream has executed at least its cap.
fn finished(limits: &Limits, current: &CreationMetrics) -> bool {
    current.nodes.executed >= limits.nodes
        && current.pods.executed >= limits.pods
        && current.jobs.executed >= limits.jobs
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::manager::{Manager, ManagerConfig, RateLimiterConfig};
    use crate::utils::test::{mock_client, spawn_recording_apiserver};

    fn sample(executed: u32) -> Metrics {
        let mut metrics = Metrics::default();
        metrics.add(executed, executed, 0);
        metrics
    }

    #[test]
    fn finished_requires_every_capped_stream() {
        let limits = Limits {
            nodes: 3,
            pods: 5,
            jobs: 0,
        };
        let mut current = CreationMetrics {
            nodes: sample(3),
            pods: sample(4),
            jobs: Metrics::default(),
        };
        assert!(!finished(&limits, &current));
        current.pods = sample(5);
        assert!(finished(&limits, &current));
    }

    #[test]
    fn unbounded_streams_render_no_bar() {
        let progress = MultiProgress::new();
        assert!(new_limit_bar(&progress, "nodes", 0).is_none());
        assert!(new_limit_bar(&progress, "nodes", 10).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_signals_completion_exactly_once() {
        let (client, handle) = mock_client();
        let _requests = spawn_recording_apiserver(handle);
        let limit = RateLimiterConfig {
            frequency: Duration::from_millis(10),
            requests: 2,
            limit: 4,
        };
        let mut manager = Manager::new(
            client,
            ManagerConfig {
                namespace: "stress".to_owned(),
                nodes: limit,
                pods: limit,
                jobs: limit,
                ..Default::default()
            },
        );

        let (tx, rx) = oneshot::channel();
        let reporter = ProgressReporter::new(
            manager.metrics(),
            Limits {
                nodes: 4,
                pods: 4,
                jobs: 4,
            },
            Duration::from_millis(10),
        )
        .on_finished(tx);
        let reporter = tokio::spawn(reporter.run(CancellationToken::new()));

        manager.start(&CancellationToken::new()).await;
        rx.await.expect("completion signalled");
        reporter.await.expect("reporter exits");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_reporter() {
        let (client, handle) = mock_client();
        let _requests = spawn_recording_apiserver(handle);
        let manager = Manager::new(
            client,
            ManagerConfig {
                namespace: "stress".to_owned(),
                ..Default::default()
            },
        );

        let shutdown = CancellationToken::new();
        let reporter = ProgressReporter::new(
            manager.metrics(),
            Limits {
                nodes: 100,
                pods: 100,
                jobs: 100,
            },
            Duration::from_millis(10),
        );
        let handle = tokio::spawn(reporter.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        handle.await.expect("reporter exits");
    }
}
