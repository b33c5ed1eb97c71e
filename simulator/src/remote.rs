//! Packaging a simulation as an in-cluster job.
//!
//! Instead of driving creations from the operator's machine, the simulator
//! can ship itself into the cluster: a job runs the `stampede run` command
//! with the same flags, and this module follows its pod logs so the run stays
//! observable from the launching terminal.

use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio_util::compat::FuturesAsyncReadCompatExt as _;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use kube::api::{Api, ListParams, LogParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use crate::manager::DEFAULT_POLL_INTERVAL;
use crate::rbac::SERVICE_ACCOUNT_NAME;
use crate::utils;

const JOB_TTL_SECONDS: i32 = 300;
const JOB_NAME_SUFFIX_LEN: usize = 5;

/// Build the job that runs the simulator inside the cluster.
///
/// `args` are appended to the `run` subcommand verbatim, so the remote run
/// mirrors the local flag set.
pub fn new_simulator_job(args: &[String], image: &str) -> Job {
    let name = format!(
        "simulator-job-{}",
        utils::random_suffix(JOB_NAME_SUFFIX_LEN)
    );
    let mut full_args = Vec::with_capacity(args.len() + 1);
    full_args.push("run".to_owned());
    full_args.extend_from_slice(args);
    Job {
        metadata: ObjectMeta {
            name: Some(name),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT_NAME.to_owned()),
                    restart_policy: Some("Never".to_owned()),
                    containers: vec![Container {
                        name: "simulator".to_owned(),
                        image: Some(image.to_owned()),
                        args: Some(full_args),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create the simulator job in `namespace` and return it.
pub async fn create_simulator_job(
    client: Client,
    namespace: &str,
    args: &[String],
    image: &str,
) -> Result<Job> {
    let jobs: Api<Job> = Api::namespaced(client, namespace);
    let job = new_simulator_job(args, image);
    let created = jobs
        .create(&PostParams::default(), &job)
        .await
        .context("failed to create simulator job")?;
    info!(
        name = created.metadata.name.as_deref().unwrap_or_default(),
        namespace, "created simulator job"
    );
    Ok(created)
}

/// Wait until the job reports a ready pod, or `timeout` elapses.
pub async fn wait_for_job_ready(
    client: Client,
    namespace: &str,
    job_name: &str,
    timeout: Duration,
) -> Result<()> {
    let jobs: Api<Job> = Api::namespaced(client, namespace);
    let job_name = job_name.to_owned();
    utils::poll_until(DEFAULT_POLL_INTERVAL, timeout, move || {
        let jobs = jobs.clone();
        let job_name = job_name.clone();
        async move {
            let job = jobs.get(&job_name).await?;
            let ready = job
                .status
                .and_then(|status| status.ready)
                .unwrap_or_default();
            Ok(ready > 0)
        }
    })
    .await
}

/// Stream the logs of every pod belonging to `job_name` to stdout, following
/// until the pods finish or the streams close.
pub async fn stream_job_logs(client: Client, namespace: &str, job_name: &str) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let selector = format!("job-name={job_name}");
    let pod_list = pods
        .list(&ListParams::default().labels(&selector))
        .await
        .with_context(|| format!("failed to list pods for job {job_name}"))?;

    let mut streams = Vec::new();
    for pod in pod_list.items {
        let Some(name) = pod.metadata.name else {
            continue;
        };
        let pods = pods.clone();
        streams.push(tokio::spawn(async move {
            info!(pod = %name, "streaming pod logs");
            let params = LogParams {
                follow: true,
                ..Default::default()
            };
            match pods.log_stream(&name, &params).await {
                Ok(stream) => {
                    let mut lines = Box::pin(stream).compat().lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        println!("{name}: {line}");
                    }
                }
                Err(err) => warn!(pod = %name, error = %err, "failed to stream pod logs"),
            }
        }));
    }
    for stream in streams {
        let _ = stream.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulator_job_runs_the_run_subcommand() {
        let args = vec!["--pod-creator-limit".to_owned(), "10".to_owned()];
        let job = new_simulator_job(&args, "stampede/simulator:latest");

        let name = job.metadata.name.as_deref().unwrap();
        assert!(name.starts_with("simulator-job-"));
        assert_eq!(name.len(), "simulator-job-".len() + JOB_NAME_SUFFIX_LEN);

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.ttl_seconds_after_finished, Some(300));
        let pod_spec = spec.template.spec.as_ref().unwrap();
        assert_eq!(
            pod_spec.service_account_name.as_deref(),
            Some(SERVICE_ACCOUNT_NAME)
        );
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        let container = &pod_spec.containers[0];
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![
                "run".to_owned(),
                "--pod-creator-limit".to_owned(),
                "10".to_owned()
            ]
        );
    }
}
