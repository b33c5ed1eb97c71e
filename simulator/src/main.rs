//! stampede is a kwok backed tool for stress testing a Kubernetes control
//! plane with synthetic batch workloads.
#![deny(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use opentelemetry::global::shutdown_tracer_provider;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stampede_common::telemetry;
use stampede_simulator::client;
use stampede_simulator::kwok::{self, OperatorStatus};
use stampede_simulator::manager::{
    ensure_namespace, Completion, Manager, ManagerConfig, RateLimiterConfig,
    DEFAULT_POLL_TIMEOUT,
};
use stampede_simulator::rbac;
use stampede_simulator::remote;
use stampede_simulator::reporter::{Limits, ProgressReporter};
use stampede_simulator::resources::{
    EnvVarsConfig, EnvVarsKind, FAKE_POD_LABEL_SELECTOR, KWOK_LABEL_SELECTOR,
};
use stampede_simulator::utils::WaitTimeout;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: GlobalOpts,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Enable verbose output.
    #[arg(long, short = 'v', global = true, conflicts_with_all = ["debug", "silent"])]
    verbose: bool,

    /// Enable debug output.
    #[arg(long, short = 'd', global = true, conflicts_with = "silent")]
    debug: bool,

    /// Disable all internal logging.
    #[arg(long, short = 's', global = true)]
    silent: bool,

    /// Disable graphical elements like progress bars.
    #[arg(long, global = true)]
    no_gui: bool,

    /// Path to the kubeconfig file; in-cluster configuration wins when both
    /// are available.
    #[arg(long, short = 'k', global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// OTLP endpoint for trace export.
    #[arg(long, global = true, env = "STAMPEDE_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl GlobalOpts {
    fn log_directive(&self) -> &'static str {
        if self.silent {
            "off"
        } else if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else {
            "warn"
        }
    }
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a simulation, creating fake nodes, pods and jobs at a
    /// configurable rate
    Run(RunOpts),
    /// Watch a simulation until all fake pods complete
    Watch(WatchOpts),
    /// Delete all resources created by the simulator
    Clean(CleanOpts),
    /// Install the kwok operator and its lifecycle stages
    Install(KwokOpts),
    /// Remove the kwok operator, its lifecycle stages and the simulator rbac
    Remove(RemoveOpts),
    /// Check that the simulation prerequisites are in place
    Check(KwokOpts),
}

#[derive(Args, Debug)]
struct RunOpts {
    /// Frequency at which to create nodes.
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    node_creator_frequency: Duration,

    /// Number of node creation requests to make in each iteration.
    #[arg(long, default_value_t = 2)]
    node_creator_requests: u32,

    /// Maximum number of nodes to create; 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    node_creator_limit: u32,

    /// Frequency at which to create pods.
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pod_creator_frequency: Duration,

    /// Number of pod creation requests to make in each iteration.
    #[arg(long, default_value_t = 5)]
    pod_creator_requests: u32,

    /// Maximum number of pods to create; 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    pod_creator_limit: u32,

    /// Frequency at which to create jobs.
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    job_creator_frequency: Duration,

    /// Number of job creation requests to make in each iteration.
    #[arg(long, default_value_t = 2)]
    job_creator_requests: u32,

    /// Maximum number of jobs to create; 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    job_creator_limit: u32,

    /// Namespace in which to create fake pods and jobs.
    #[arg(long, short = 'n', default_value = "default")]
    namespace: String,

    /// Pad pod specs with env vars of random size instead of a fixed class.
    #[arg(long)]
    random_env_vars: bool,

    /// Env var size class (nano, micro, xsmall, small, medium, large,
    /// xlarge, xlarge2, xlarge8); unknown names fall back to medium.
    #[arg(long, default_value = "medium")]
    default_env_vars_type: String,

    /// Number of env vars in a pod spec.
    #[arg(long, default_value_t = 5)]
    env_var_count: usize,

    /// Maximum size of an env var in bytes.
    #[arg(long, default_value_t = 10240)]
    max_env_var_size: usize,

    /// Run the simulator as a job inside the cluster instead of locally.
    #[arg(long, short = 'r')]
    remote: bool,

    /// Namespace in which to create the remote simulator job.
    #[arg(long, default_value = "default")]
    simulator_namespace: String,

    /// Image to use for the remote simulator job.
    #[arg(long, default_value = "ghcr.io/stampede-sim/stampede:latest")]
    simulator_image: String,
}

#[derive(Args, Debug)]
struct WatchOpts {
    /// Namespace in which the fake pods were created.
    #[arg(long, short = 'n', default_value = "default")]
    namespace: String,
}

#[derive(Args, Debug)]
struct CleanOpts {
    /// Namespace from which to delete fake pods and jobs.
    #[arg(long, short = 'n', default_value = "default")]
    namespace: String,

    /// Resources to delete (nodes, pods, jobs); all of them when empty.
    #[arg(long, short = 'r', value_delimiter = ',')]
    resources: Vec<String>,
}

#[derive(Args, Debug)]
struct KwokOpts {
    /// Namespace in which the kwok operator is expected or installed.
    #[arg(long, default_value = kwok::DEFAULT_KWOK_NAMESPACE)]
    kwok_namespace: String,
}

#[derive(Args, Debug)]
struct RemoveOpts {
    /// Namespace in which the kwok operator is expected or installed.
    #[arg(long, default_value = kwok::DEFAULT_KWOK_NAMESPACE)]
    kwok_namespace: String,

    /// Namespace in which the remote simulator job was provisioned.
    #[arg(long, default_value = "default")]
    simulator_namespace: String,
}

fn parse_duration(arg: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(arg)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    if tracing_log::LogTracer::init().is_err() {
        eprintln!("failed to initialize log bridge");
        return ExitCode::from(2);
    }
    if let Err(err) =
        telemetry::init_tracing(args.global.otlp_endpoint.clone(), args.global.log_directive())
            .await
    {
        eprintln!("failed to initialize telemetry: {err:#}");
        return ExitCode::from(2);
    }

    let result = match &args.command {
        Command::Run(opts) => run(&args.global, opts).await,
        Command::Watch(opts) => watch(&args.global, opts).await,
        Command::Clean(opts) => clean(&args.global, opts).await,
        Command::Install(opts) => install(&args.global, opts).await,
        Command::Remove(opts) => remove(&args.global, opts).await,
        Command::Check(opts) => check(&args.global, opts).await,
    };

    // Flush traces before shutdown
    shutdown_tracer_provider();

    match result {
        Ok(code) => code,
        Err(err) => {
            error!(error = format!("{err:#}"), "command failed");
            ExitCode::from(2)
        }
    }
}

fn status_code(fatal: bool, warning: bool) -> ExitCode {
    if fatal {
        error!("one or more steps encountered fatal errors");
        ExitCode::from(2)
    } else if warning {
        warn!("one or more steps reported warnings");
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(global: &GlobalOpts, opts: &RunOpts) -> Result<ExitCode> {
    info!(
        nodes = format!(
            "{}/{:?}/{}",
            opts.node_creator_requests, opts.node_creator_frequency, opts.node_creator_limit
        ),
        pods = format!(
            "{}/{:?}/{}",
            opts.pod_creator_requests, opts.pod_creator_frequency, opts.pod_creator_limit
        ),
        jobs = format!(
            "{}/{:?}/{}",
            opts.job_creator_requests, opts.job_creator_frequency, opts.job_creator_limit
        ),
        namespace = opts.namespace,
        "running simulation"
    );
    let client = client::new_client(global.kubeconfig.as_deref()).await?;

    if opts.remote {
        return run_remote(client, opts).await;
    }

    ensure_namespace(client.clone(), &opts.namespace)
        .await
        .context("failed to initialize namespace")?;

    let env_vars = EnvVarsConfig {
        count: opts.env_var_count,
        max_size: opts.max_env_var_size,
        kind: EnvVarsKind::parse(&opts.default_env_vars_type),
        random: opts.random_env_vars,
    };
    let mut manager = Manager::new(
        client,
        ManagerConfig {
            namespace: opts.namespace.clone(),
            env_vars,
            nodes: RateLimiterConfig {
                frequency: opts.node_creator_frequency,
                requests: opts.node_creator_requests,
                limit: opts.node_creator_limit,
            },
            pods: RateLimiterConfig {
                frequency: opts.pod_creator_frequency,
                requests: opts.pod_creator_requests,
                limit: opts.pod_creator_limit,
            },
            jobs: RateLimiterConfig {
                frequency: opts.job_creator_frequency,
                requests: opts.job_creator_requests,
                limit: opts.job_creator_limit,
            },
        },
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, stopping simulation");
                shutdown.cancel();
            }
        }
    });

    let mut finished = None;
    if !global.no_gui {
        let (tx, rx) = oneshot::channel();
        let reporter = ProgressReporter::new(
            manager.metrics(),
            Limits {
                nodes: opts.node_creator_limit,
                pods: opts.pod_creator_limit,
                jobs: opts.job_creator_limit,
            },
            Duration::from_secs(1),
        )
        .on_finished(tx);
        tokio::spawn(reporter.run(shutdown.child_token()));
        finished = Some(rx);
    }

    let completion = manager.start(&shutdown).await;
    if completion == Completion::Finished {
        // Let the reporter observe the final counts before summarizing.
        if let Some(rx) = finished {
            let _ = rx.await;
        }
    }

    let totals = manager.metrics().snapshot().await;
    info!(
        nodes = %totals.nodes,
        pods = %totals.pods,
        jobs = %totals.jobs,
        "simulation finished"
    );
    println!("nodes {}", totals.nodes);
    println!("pods  {}", totals.pods);
    println!("jobs  {}", totals.jobs);
    if completion == Completion::Cancelled {
        println!("simulation cancelled before completion");
    }

    let warning =
        totals.nodes.failed > 0 || totals.pods.failed > 0 || totals.jobs.failed > 0;
    Ok(status_code(false, warning))
}

// Package the same flag set as an in-cluster job and follow its logs.
async fn run_remote(client: kube::Client, opts: &RunOpts) -> Result<ExitCode> {
    ensure_namespace(client.clone(), &opts.simulator_namespace)
        .await
        .context("failed to initialize simulator namespace")?;
    ensure_namespace(client.clone(), &opts.namespace)
        .await
        .context("failed to initialize namespace")?;
    rbac::apply_rbac(client.clone(), &opts.simulator_namespace)
        .await
        .context("failed to provision simulator rbac")?;

    let job = remote::create_simulator_job(
        client.clone(),
        &opts.simulator_namespace,
        &remote_args(opts),
        &opts.simulator_image,
    )
    .await?;
    let job_name = job
        .metadata
        .name
        .context("created job should have a name")?;

    info!(job = %job_name, "waiting for simulator job to become ready");
    remote::wait_for_job_ready(
        client.clone(),
        &opts.simulator_namespace,
        &job_name,
        DEFAULT_POLL_TIMEOUT,
    )
    .await
    .context("failed to wait for simulator job to become ready")?;

    remote::stream_job_logs(client, &opts.simulator_namespace, &job_name).await?;
    Ok(ExitCode::SUCCESS)
}

fn remote_args(opts: &RunOpts) -> Vec<String> {
    let mut args = vec![
        "--node-creator-frequency".to_owned(),
        humantime::format_duration(opts.node_creator_frequency).to_string(),
        "--node-creator-requests".to_owned(),
        opts.node_creator_requests.to_string(),
        "--node-creator-limit".to_owned(),
        opts.node_creator_limit.to_string(),
        "--pod-creator-frequency".to_owned(),
        humantime::format_duration(opts.pod_creator_frequency).to_string(),
        "--pod-creator-requests".to_owned(),
        opts.pod_creator_requests.to_string(),
        "--pod-creator-limit".to_owned(),
        opts.pod_creator_limit.to_string(),
        "--job-creator-frequency".to_owned(),
        humantime::format_duration(opts.job_creator_frequency).to_string(),
        "--job-creator-requests".to_owned(),
        opts.job_creator_requests.to_string(),
        "--job-creator-limit".to_owned(),
        opts.job_creator_limit.to_string(),
        "--default-env-vars-type".to_owned(),
        opts.default_env_vars_type.clone(),
        "--env-var-count".to_owned(),
        opts.env_var_count.to_string(),
        "--max-env-var-size".to_owned(),
        opts.max_env_var_size.to_string(),
        "--namespace".to_owned(),
        opts.namespace.clone(),
        "--no-gui".to_owned(),
        "--verbose".to_owned(),
    ];
    if opts.random_env_vars {
        args.push("--random-env-vars".to_owned());
    }
    args
}

async fn watch(global: &GlobalOpts, opts: &WatchOpts) -> Result<ExitCode> {
    let client = client::new_client(global.kubeconfig.as_deref()).await?;
    let manager = Manager::new(
        client,
        ManagerConfig {
            namespace: opts.namespace.clone(),
            ..Default::default()
        },
    );

    info!(namespace = opts.namespace, "waiting for simulation pods to complete");
    let started = Instant::now();
    match manager.wait_for_pods_to_complete(FAKE_POD_LABEL_SELECTOR).await {
        Ok(()) => {
            let elapsed = Duration::from_secs(started.elapsed().as_secs());
            info!(?elapsed, "all simulation pods completed");
            println!(
                "all simulation pods completed after {}",
                humantime::format_duration(elapsed)
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(err) if err.is::<WaitTimeout>() => {
            warn!("timed out waiting for simulation pods to complete");
            Ok(status_code(false, true))
        }
        Err(err) => Err(err),
    }
}

async fn clean(global: &GlobalOpts, opts: &CleanOpts) -> Result<ExitCode> {
    let mut resources = opts.resources.clone();
    for resource in &resources {
        match resource.as_str() {
            "nodes" | "node" | "pods" | "pod" | "jobs" | "job" => {}
            other => bail!("unsupported resource type {other}, --resources supports only node(s), pod(s), job(s)"),
        }
    }
    if resources.is_empty() {
        resources = vec!["nodes".to_owned(), "pods".to_owned(), "jobs".to_owned()];
    }
    info!(?resources, "cleaning up simulation data");

    let client = client::new_client(global.kubeconfig.as_deref()).await?;
    let manager = Manager::new(
        client,
        ManagerConfig {
            namespace: opts.namespace.clone(),
            ..Default::default()
        },
    );

    let enabled = |names: [&str; 2]| {
        resources
            .iter()
            .any(|resource| names.contains(&resource.as_str()))
    };
    let (nodes, pods, jobs) = tokio::join!(
        async {
            if enabled(["nodes", "node"]) {
                Some(manager.delete_nodes(KWOK_LABEL_SELECTOR, true).await)
            } else {
                None
            }
        },
        async {
            if enabled(["pods", "pod"]) {
                Some(manager.delete_pods(KWOK_LABEL_SELECTOR, true).await)
            } else {
                None
            }
        },
        async {
            if enabled(["jobs", "job"]) {
                Some(manager.delete_jobs(KWOK_LABEL_SELECTOR, true).await)
            } else {
                None
            }
        },
    );

    let mut fatal = false;
    let mut warning = false;
    for (kind, outcome) in [("nodes", nodes), ("pods", pods), ("jobs", jobs)] {
        match outcome {
            None => {}
            Some(Ok(())) => info!(kind, "all resources fully terminated"),
            Some(Err(err)) if err.is::<WaitTimeout>() => {
                warn!(kind, "timed out waiting for resources to terminate");
                warning = true;
            }
            Some(Err(err)) => {
                error!(kind, error = format!("{err:#}"), "failed to clean up resources");
                fatal = true;
            }
        }
    }
    Ok(status_code(fatal, warning))
}

async fn install(global: &GlobalOpts, opts: &KwokOpts) -> Result<ExitCode> {
    info!(namespace = opts.kwok_namespace, "installing simulator components");
    let client = client::new_client(global.kubeconfig.as_deref()).await?;

    kwok::install_operator(&opts.kwok_namespace)
        .await
        .context("failed to install kwok operator")?;

    info!("waiting for kwok operator to become available");
    let mut warning = false;
    match kwok::operator_running(client.clone(), &opts.kwok_namespace).await? {
        OperatorStatus::Running => info!("kwok operator is running"),
        OperatorStatus::NotInstalled => {
            warn!("kwok operator is not installed");
            warning = true;
        }
        OperatorStatus::NotReady => {
            warn!("timed out waiting for kwok operator to start");
            warning = true;
        }
    }

    kwok::create_stages()
        .await
        .context("failed to create kwok stages")?;
    info!("kwok stages created");
    Ok(status_code(false, warning))
}

async fn remove(global: &GlobalOpts, opts: &RemoveOpts) -> Result<ExitCode> {
    info!(namespace = opts.kwok_namespace, "removing simulator components");
    let mut warning = false;

    if let Err(err) = kwok::delete_stages().await {
        warn!(error = format!("{err:#}"), "failed to delete kwok stages");
        warning = true;
    }
    if let Err(err) = kwok::uninstall_operator(&opts.kwok_namespace).await {
        warn!(error = format!("{err:#}"), "failed to uninstall kwok operator");
        warning = true;
    }

    // Tear down what run --remote provisioned.
    let client = client::new_client(global.kubeconfig.as_deref()).await?;
    if let Err(err) = rbac::delete_rbac(client, &opts.simulator_namespace).await {
        warn!(error = format!("{err:#}"), "failed to delete simulator rbac");
        warning = true;
    }
    Ok(status_code(false, warning))
}

async fn check(global: &GlobalOpts, opts: &KwokOpts) -> Result<ExitCode> {
    let mut warning = false;

    if kwok::kubectl_installed().await {
        info!("kubectl is installed");
    } else {
        warn!("kubectl is not installed");
        warning = true;
    }
    if kwok::kwok_installed().await {
        info!("kwok is installed");
    } else {
        warn!("kwok is not installed");
        warning = true;
    }

    let client = client::new_client(global.kubeconfig.as_deref()).await?;
    match kwok::operator_running(client.clone(), &opts.kwok_namespace).await? {
        OperatorStatus::Running => info!("kwok operator is running"),
        OperatorStatus::NotInstalled => {
            warn!("kwok operator is not installed");
            warning = true;
        }
        OperatorStatus::NotReady => {
            warn!("kwok operator is installed but not available");
            warning = true;
        }
    }

    let missing = kwok::missing_stages(client).await?;
    if missing.is_empty() {
        info!("all kwok stages are created");
    } else {
        warn!(?missing, "some kwok stages are missing");
        warning = true;
    }
    Ok(status_code(false, warning))
}
