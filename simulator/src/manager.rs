//! Coordination of the three resource producers and cleanup of their output.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::executors::{JobCreator, NodeCreator, PodCreator};
use crate::limiter::{CreateError, Executor, Metrics, RateLimiter};
use crate::resources::EnvVarsConfig;
use crate::utils;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Default cadence for deletion and readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default deadline for deletion and readiness polls.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(150);

const DEFAULT_FREQUENCY: Duration = Duration::from_secs(1);
const DEFAULT_NODE_REQUESTS: u32 = 5;
const DEFAULT_POD_REQUESTS: u32 = 10;
const DEFAULT_JOB_REQUESTS: u32 = 5;
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Tuning for one rate limited producer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimiterConfig {
    /// Duration between ticks.
    pub frequency: Duration,
    /// Creations attempted per tick.
    pub requests: u32,
    /// Cap on total executions; `0` disables the cap.
    pub limit: u32,
}

/// Configuration for a [`Manager`].
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Namespace in which pods and jobs are created.
    pub namespace: String,
    /// Sizing of the synthetic env vars attached to pods and jobs.
    pub env_vars: EnvVarsConfig,
    /// Tuning for the node producer.
    pub nodes: RateLimiterConfig,
    /// Tuning for the pod producer.
    pub pods: RateLimiterConfig,
    /// Tuning for the job producer.
    pub jobs: RateLimiterConfig,
}

impl ManagerConfig {
    // Zero values are configuration defects; replace them with the stock
    // defaults instead of rejecting the config.
    fn defaulted(mut self) -> Self {
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_owned();
        }
        for config in [&mut self.nodes, &mut self.pods, &mut self.jobs] {
            if config.frequency.is_zero() {
                config.frequency = DEFAULT_FREQUENCY;
            }
        }
        if self.nodes.requests == 0 {
            self.nodes.requests = DEFAULT_NODE_REQUESTS;
        }
        if self.pods.requests == 0 {
            self.pods.requests = DEFAULT_POD_REQUESTS;
        }
        if self.jobs.requests == 0 {
            self.jobs.requests = DEFAULT_JOB_REQUESTS;
        }
        self
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every producer stopped on its own.
    Finished,
    /// The ambient cancellation fired before the producers were done.
    Cancelled,
}

/// One consistent sample of all three producers' counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CreationMetrics {
    /// Node creation counters.
    pub nodes: Metrics,
    /// Pod creation counters.
    pub pods: Metrics,
    /// Job creation counters.
    pub jobs: Metrics,
}

/// Read-only view of the producers' counters, shared with the reporter.
///
/// The watcher never mutates producer state and is safe to poll from a
/// separate task while the manager runs.
#[derive(Clone)]
pub struct MetricsWatcher {
    nodes: Arc<RateLimiter<NodeCreator>>,
    pods: Arc<RateLimiter<PodCreator>>,
    jobs: Arc<RateLimiter<JobCreator>>,
}

impl MetricsWatcher {
    /// Sample all three producers.
    pub async fn snapshot(&self) -> CreationMetrics {
        CreationMetrics {
            nodes: self.nodes.metrics().await,
            pods: self.pods.metrics().await,
            jobs: self.jobs.metrics().await,
        }
    }
}

/// Owns the three producers, runs them concurrently and cleans up after them.
pub struct Manager {
    client: Client,
    namespace: String,
    node_creator: Arc<RateLimiter<NodeCreator>>,
    pod_creator: Arc<RateLimiter<PodCreator>>,
    job_creator: Arc<RateLimiter<JobCreator>>,
    node_errors: mpsc::Receiver<CreateError>,
    pod_errors: mpsc::Receiver<CreateError>,
    job_errors: mpsc::Receiver<CreateError>,
}

impl Manager {
    /// Build a manager and its producers from `config`, substituting defaults
    /// for zero values.
    pub fn new(client: Client, config: ManagerConfig) -> Self {
        let config = config.defaulted();
        let node_creator = Arc::new(RateLimiter::new(
            config.nodes.frequency,
            config.nodes.requests,
            config.nodes.limit,
            NodeCreator::new(client.clone()),
        ));
        let pod_creator = Arc::new(RateLimiter::new(
            config.pods.frequency,
            config.pods.requests,
            config.pods.limit,
            PodCreator::new(
                client.clone(),
                config.namespace.clone(),
                config.env_vars.clone(),
            ),
        ));
        let job_creator = Arc::new(RateLimiter::new(
            config.jobs.frequency,
            config.jobs.requests,
            config.jobs.limit,
            JobCreator::new(client.clone(), config.namespace.clone(), config.env_vars),
        ));
        let node_errors = node_creator
            .errors()
            .expect("fresh rate limiter should still own its error stream");
        let pod_errors = pod_creator
            .errors()
            .expect("fresh rate limiter should still own its error stream");
        let job_errors = job_creator
            .errors()
            .expect("fresh rate limiter should still own its error stream");
        Self {
            client,
            namespace: config.namespace,
            node_creator,
            pod_creator,
            job_creator,
            node_errors,
            pod_errors,
            job_errors,
        }
    }

    /// Run all three producers until they finish on their own or `shutdown`
    /// fires.
    ///
    /// Producer errors are logged and do not terminate the run; only
    /// cancellation or all producers stopping does.
    pub async fn start(&mut self, shutdown: &CancellationToken) -> Completion {
        info!("starting resource manager");
        spawn_producer(&self.node_creator, shutdown.child_token());
        spawn_producer(&self.pod_creator, shutdown.child_token());
        spawn_producer(&self.job_creator, shutdown.child_token());

        let mut liveness =
            time::interval_at(time::Instant::now() + LIVENESS_INTERVAL, LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                Some(err) = self.node_errors.recv() => {
                    error!(error = %err, "received error from node rate limiter");
                }
                Some(err) = self.pod_errors.recv() => {
                    error!(error = %err, "received error from pod rate limiter");
                }
                Some(err) = self.job_errors.recv() => {
                    error!(error = %err, "received error from job rate limiter");
                }
                _ = shutdown.cancelled() => {
                    self.stop();
                    return Completion::Cancelled;
                }
                _ = liveness.tick() => {
                    if !self.node_creator.is_running()
                        && !self.pod_creator.is_running()
                        && !self.job_creator.is_running()
                    {
                        self.stop();
                        return Completion::Finished;
                    }
                }
            }
        }
    }

    /// Stop every producer. Safe to call repeatedly.
    pub fn stop(&self) {
        info!("stopping resource manager");
        self.node_creator.stop();
        self.pod_creator.stop();
        self.job_creator.stop();
    }

    /// Shared read access to the producers' counters.
    pub fn metrics(&self) -> MetricsWatcher {
        MetricsWatcher {
            nodes: self.node_creator.clone(),
            pods: self.pod_creator.clone(),
            jobs: self.job_creator.clone(),
        }
    }

    /// Delete all nodes matching `selector`. When `wait` is set, block until
    /// the collection is empty or the poll deadline passes.
    pub async fn delete_nodes(&self, selector: &str, wait: bool) -> anyhow::Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        info!(selector, wait, "deleting nodes");
        api.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(selector),
        )
        .await
        .with_context(|| format!("failed to delete nodes with selector {selector}"))?;
        if wait {
            wait_for_empty(selector, move |params| {
                let api = api.clone();
                async move { Ok(api.list(&params).await?.items.is_empty()) }
            })
            .await?;
        }
        Ok(())
    }

    /// Delete all pods in the managed namespace matching `selector`. When
    /// `wait` is set, block until the collection is empty or the poll
    /// deadline passes.
    pub async fn delete_pods(&self, selector: &str, wait: bool) -> anyhow::Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        info!(selector, wait, "deleting pods");
        api.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(selector),
        )
        .await
        .with_context(|| format!("failed to delete pods with selector {selector}"))?;
        if wait {
            wait_for_empty(selector, move |params| {
                let api = api.clone();
                async move { Ok(api.list(&params).await?.items.is_empty()) }
            })
            .await?;
        }
        Ok(())
    }

    /// Delete all jobs in the managed namespace matching `selector`, letting
    /// the control plane reap their pods in the background. When `wait` is
    /// set, block until the collection is empty or the poll deadline passes.
    pub async fn delete_jobs(&self, selector: &str, wait: bool) -> anyhow::Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        info!(selector, wait, "deleting jobs");
        api.delete_collection(
            &DeleteParams::background(),
            &ListParams::default().labels(selector),
        )
        .await
        .with_context(|| format!("failed to delete jobs with selector {selector}"))?;
        if wait {
            wait_for_empty(selector, move |params| {
                let api = api.clone();
                async move { Ok(api.list(&params).await?.items.is_empty()) }
            })
            .await?;
        }
        Ok(())
    }

    /// Wait until every pod matching `selector` in the managed namespace has
    /// run to completion, successfully or not.
    pub async fn wait_for_pods_to_complete(&self, selector: &str) -> anyhow::Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = selector.to_owned();
        utils::poll_until(Duration::from_secs(60), Duration::from_secs(3 * 3600), move || {
            let api = api.clone();
            let selector = selector.clone();
            async move {
                let pods = api.list(&ListParams::default().labels(&selector)).await?;
                let running = pods
                    .items
                    .iter()
                    .filter(|pod| {
                        let phase = pod
                            .status
                            .as_ref()
                            .and_then(|status| status.phase.as_deref());
                        !matches!(phase, Some("Succeeded") | Some("Failed"))
                    })
                    .count();
                debug!(total = pods.items.len(), running, "checked pod completion");
                Ok(running == 0)
            }
        })
        .await
    }
}

// The handle is intentionally detached; a stopped producer exits at its next
// tick.
fn spawn_producer<E>(limiter: &Arc<RateLimiter<E>>, shutdown: CancellationToken)
where
    E: Executor + 'static,
{
    let limiter = Arc::clone(limiter);
    tokio::spawn(async move { limiter.run(shutdown).await });
}

async fn wait_for_empty<F, Fut>(selector: &str, mut list_is_empty: F) -> anyhow::Result<()>
where
    F: FnMut(ListParams) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
    let selector = selector.to_owned();
    utils::poll_until(DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT, move || {
        list_is_empty(ListParams::default().labels(&selector))
    })
    .await
}

/// Create `namespace` if it does not already exist.
pub async fn ensure_namespace(client: Client, namespace: &str) -> Result<(), kube::Error> {
    let namespaces: Api<Namespace> = Api::all(client);
    if namespaces.get_opt(namespace).await?.is_some() {
        debug!(namespace, "namespace already exists");
        return Ok(());
    }
    info!(namespace, "creating namespace");
    let object = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_owned()),
            ..Default::default()
        },
        ..Default::default()
    };
    match namespaces.create(&PostParams::default(), &object).await {
        Ok(_) => Ok(()),
        // Lost the race against another creator; the namespace exists.
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
        Err(err) => Err(err),
    }
}
