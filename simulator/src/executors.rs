//! Kubernetes-backed executors for the rate limited producers.
//!
//! Each creator fabricates a fresh resource with a collision resistant name
//! and submits it through a typed API. Failures are wrapped with the identity
//! of the object that could not be created and are never retried.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, PostParams};
use kube::Client;

use crate::limiter::{CreateError, Executor};
use crate::resources::{self, EnvVarsConfig};
use crate::utils;

const NAME_SUFFIX_LEN: usize = 16;

/// Creates fake nodes.
pub struct NodeCreator {
    api: Api<Node>,
}

impl NodeCreator {
    /// Node creator over the given client. Nodes are cluster scoped.
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl Executor for NodeCreator {
    fn identifier(&self) -> &'static str {
        "fake-node-creator"
    }

    async fn execute(&self) -> Result<(), CreateError> {
        let name = format!("fake-node-{}", utils::random_suffix(NAME_SUFFIX_LEN));
        let node = resources::new_fake_node(&name);
        match self.api.create(&PostParams::default(), &node).await {
            Ok(_) => Ok(()),
            Err(err) => Err(CreateError::new(err, "v1", "Node", "", &name)),
        }
    }
}

/// Creates fake pods in a fixed namespace.
pub struct PodCreator {
    api: Api<Pod>,
    namespace: String,
    env_vars: EnvVarsConfig,
}

impl PodCreator {
    /// Pod creator over the given client and namespace.
    pub fn new(client: Client, namespace: String, env_vars: EnvVarsConfig) -> Self {
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            env_vars,
        }
    }
}

#[async_trait]
impl Executor for PodCreator {
    fn identifier(&self) -> &'static str {
        "fake-pod-creator"
    }

    async fn execute(&self) -> Result<(), CreateError> {
        let name = format!("fake-pod-{}", utils::random_suffix(NAME_SUFFIX_LEN));
        let pod = resources::new_fake_pod(&name, &self.namespace, &self.env_vars);
        match self.api.create(&PostParams::default(), &pod).await {
            Ok(_) => Ok(()),
            Err(err) => Err(CreateError::new(err, "v1", "Pod", &self.namespace, &name)),
        }
    }
}

/// Creates fake jobs in a fixed namespace.
pub struct JobCreator {
    api: Api<Job>,
    namespace: String,
    env_vars: EnvVarsConfig,
}

impl JobCreator {
    /// Job creator over the given client and namespace.
    pub fn new(client: Client, namespace: String, env_vars: EnvVarsConfig) -> Self {
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            env_vars,
        }
    }
}

#[async_trait]
impl Executor for JobCreator {
    fn identifier(&self) -> &'static str {
        "fake-job-creator"
    }

    async fn execute(&self) -> Result<(), CreateError> {
        let name = format!("fake-job-{}", utils::random_suffix(NAME_SUFFIX_LEN));
        let job = resources::new_fake_job(&name, &self.namespace, &self.env_vars);
        match self.api.create(&PostParams::default(), &job).await {
            Ok(_) => Ok(()),
            Err(err) => Err(CreateError::new(
                err,
                "batch/v1",
                "Job",
                &self.namespace,
                &name,
            )),
        }
    }
}
