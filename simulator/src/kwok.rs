//! Installation and readiness checks for the kwok operator.
//!
//! The operator and its lifecycle stages are applied with `kubectl` from the
//! pinned upstream release manifests; this module only shells out and
//! verifies, it never templates manifests itself.

use std::process::Stdio;

use anyhow::{bail, Context as _, Result};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info};

use crate::manager::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};
use crate::utils::{self, WaitTimeout};

/// Namespace in which the kwok operator is expected or installed.
pub const DEFAULT_KWOK_NAMESPACE: &str = "kube-system";

const KWOK_REPOSITORY: &str = "kubernetes-sigs/kwok";
const KWOK_VERSION: &str = "v0.4.0";
const OPERATOR_DEPLOYMENT: &str = "kwok-controller";

/// Lifecycle stages the simulation depends on for node and pod churn.
pub const REQUIRED_STAGES: [&str; 5] = [
    "node-heartbeat-with-lease",
    "node-initialize",
    "pod-complete",
    "pod-delete",
    "pod-ready",
];

fn operator_manifest() -> String {
    format!("https://github.com/{KWOK_REPOSITORY}/releases/download/{KWOK_VERSION}/kwok.yaml")
}

fn stages_manifest() -> String {
    format!("https://github.com/{KWOK_REPOSITORY}/releases/download/{KWOK_VERSION}/stage-fast.yaml")
}

/// Readiness of the kwok operator deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorStatus {
    /// The deployment has at least one available replica.
    Running,
    /// The deployment does not exist.
    NotInstalled,
    /// The deployment exists but never became available within the deadline.
    NotReady,
}

/// Install the kwok operator into `namespace`.
pub async fn install_operator(namespace: &str) -> Result<()> {
    kubectl(&[
        "apply",
        "--filename",
        &operator_manifest(),
        "--namespace",
        namespace,
    ])
    .await
}

/// Remove the kwok operator from `namespace`.
pub async fn uninstall_operator(namespace: &str) -> Result<()> {
    kubectl(&[
        "delete",
        "--filename",
        &operator_manifest(),
        "--namespace",
        namespace,
    ])
    .await
}

/// Apply the lifecycle stages that drive fake node and pod state.
pub async fn create_stages() -> Result<()> {
    kubectl(&["apply", "--filename", &stages_manifest()]).await
}

/// Delete the lifecycle stages.
pub async fn delete_stages() -> Result<()> {
    kubectl(&["delete", "--filename", &stages_manifest()]).await
}

/// Whether a working `kubectl` binary is on the path.
pub async fn kubectl_installed() -> bool {
    binary_responds("kubectl", &["version", "--client"]).await
}

/// Whether a working `kwok` binary is on the path.
pub async fn kwok_installed() -> bool {
    binary_responds("kwok", &["--version"]).await
}

/// Wait for the operator deployment in `namespace` to report at least one
/// available replica.
pub async fn operator_running(client: Client, namespace: &str) -> Result<OperatorStatus> {
    let deployments: Api<Deployment> = Api::namespaced(client, namespace);
    let poll = utils::poll_until(DEFAULT_POLL_INTERVAL, 2 * DEFAULT_POLL_TIMEOUT, move || {
        let deployments = deployments.clone();
        async move {
            let Some(deployment) = deployments.get_opt(OPERATOR_DEPLOYMENT).await? else {
                bail!(NotInstalled);
            };
            let available = deployment
                .status
                .and_then(|status| status.available_replicas)
                .unwrap_or_default();
            Ok(available > 0)
        }
    })
    .await;
    match poll {
        Ok(()) => Ok(OperatorStatus::Running),
        Err(err) if err.is::<NotInstalled>() => Ok(OperatorStatus::NotInstalled),
        Err(err) if err.is::<WaitTimeout>() => Ok(OperatorStatus::NotReady),
        Err(err) => Err(err),
    }
}

/// Check which of the required lifecycle stages exist; returns the missing
/// stage names.
pub async fn missing_stages(client: Client) -> Result<Vec<&'static str>> {
    let gvk = GroupVersionKind::gvk("kwok.x-k8s.io", "v1alpha1", "Stage");
    let stages: Api<DynamicObject> = Api::all_with(client, &ApiResource::from_gvk(&gvk));
    let mut missing = Vec::new();
    for stage in REQUIRED_STAGES {
        if stages
            .get_opt(stage)
            .await
            .with_context(|| format!("failed to look up stage {stage}"))?
            .is_none()
        {
            missing.push(stage);
        }
    }
    Ok(missing)
}

#[derive(Debug, thiserror::Error)]
#[error("kwok operator is not installed")]
struct NotInstalled;

// Run kubectl, forwarding its output lines to the log as they arrive.
async fn kubectl(args: &[&str]) -> Result<()> {
    info!(?args, "running kubectl");
    let mut child = Command::new("kubectl")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn kubectl")?;

    let stdout = child.stdout.take().expect("stdout should be piped");
    let stderr = child.stderr.take().expect("stderr should be piped");
    let out = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(process = "kubectl", "{line}");
        }
    });
    let err = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            error!(process = "kubectl", "{line}");
        }
    });

    let status = child.wait().await.context("failed to wait for kubectl")?;
    let _ = tokio::join!(out, err);
    if !status.success() {
        bail!("kubectl {args:?} exited with {status}");
    }
    Ok(())
}

async fn binary_responds(binary: &str, args: &[&str]) -> bool {
    Command::new(binary)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::Response;
    use hyper::Body;

    use crate::utils::test::{mock_client, timeout_after_1s};

    fn not_found() -> Response<Body> {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "not found",
            "reason": "NotFound",
            "code": 404,
        });
        Response::builder()
            .status(404)
            .body(Body::from(status.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn missing_operator_is_reported_as_not_installed() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(
                request.uri().path(),
                "/apis/apps/v1/namespaces/kube-system/deployments/kwok-controller"
            );
            send.send_response(not_found());
        });

        let status = operator_running(client, DEFAULT_KWOK_NAMESPACE)
            .await
            .expect("status check succeeds");
        assert_eq!(status, OperatorStatus::NotInstalled);
        timeout_after_1s(server).await;
    }

    #[tokio::test]
    async fn available_operator_is_reported_as_running() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("service not called");
            let deployment = serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "kwok-controller", "namespace": "kube-system"},
                "status": {"availableReplicas": 1},
            });
            send.send_response(
                Response::builder()
                    .status(200)
                    .body(Body::from(deployment.to_string()))
                    .unwrap(),
            );
        });

        let status = operator_running(client, DEFAULT_KWOK_NAMESPACE)
            .await
            .expect("status check succeeds");
        assert_eq!(status, OperatorStatus::Running);
        timeout_after_1s(server).await;
    }

    #[tokio::test]
    async fn absent_stages_are_listed_as_missing() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            for _ in REQUIRED_STAGES {
                let (request, send) = handle.next_request().await.expect("service not called");
                assert!(request
                    .uri()
                    .path()
                    .starts_with("/apis/kwok.x-k8s.io/v1alpha1/stages/"));
                send.send_response(not_found());
            }
        });

        let missing = missing_stages(client).await.expect("lookup succeeds");
        assert_eq!(missing, REQUIRED_STAGES.to_vec());
        timeout_after_1s(server).await;
    }
}
