//! Factories for the synthetic resources the simulator creates.
//!
//! Everything produced here carries the labels, tolerations and affinity the
//! kwok operator keys on, so fabricated nodes adopt fabricated pods without
//! any real kubelet involved.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, Node, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, NodeSpec, NodeStatus, NodeSystemInfo, Pod, PodSpec, PodTemplateSpec,
    ResourceRequirements, Taint, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::ObjectMeta;
use rand::Rng;

use crate::utils;

/// Label key identifying the application of a fabricated resource.
pub const LABEL_KEY_APP: &str = "app";
/// `app` label value carried by fabricated pods.
pub const LABEL_VALUE_FAKE_POD: &str = "fake-pod";
/// `app` label value carried by fabricated jobs.
pub const LABEL_VALUE_FAKE_JOB: &str = "fake-job";
/// Selector matching every resource the simulator fabricates.
pub const KWOK_LABEL_SELECTOR: &str = "type=kwok";
/// Selector matching only the fabricated pods.
pub const FAKE_POD_LABEL_SELECTOR: &str = "app=fake-pod";

const KWOK_NODE_ANNOTATION: &str = "kwok.x-k8s.io/node";
const POD_CIDR: &str = "10.233.1.0/24";

/// Named env var size classes, in bytes per variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub enum EnvVarsKind {
    Nano,
    Micro,
    Xsmall,
    Small,
    #[default]
    Medium,
    Large,
    Xlarge,
    Xlarge2,
    Xlarge8,
}

impl EnvVarsKind {
    /// Map a class name to its kind. Unknown names fall back to `Medium`.
    pub fn parse(name: &str) -> Self {
        match name {
            "nano" => Self::Nano,
            "micro" => Self::Micro,
            "xsmall" => Self::Xsmall,
            "small" => Self::Small,
            "medium" => Self::Medium,
            "large" => Self::Large,
            "xlarge" => Self::Xlarge,
            "xlarge2" => Self::Xlarge2,
            "xlarge8" => Self::Xlarge8,
            _ => Self::Medium,
        }
    }

    /// Canonical name of the class.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nano => "nano",
            Self::Micro => "micro",
            Self::Xsmall => "xsmall",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Xlarge => "xlarge",
            Self::Xlarge2 => "xlarge2",
            Self::Xlarge8 => "xlarge8",
        }
    }

    /// Bytes per env var value for this class.
    pub fn value_size(&self) -> usize {
        match self {
            Self::Nano => 100,
            Self::Micro => 200,
            Self::Xsmall => 500,
            Self::Small => 1024,
            Self::Medium => 2 * 1024,
            Self::Large => 4 * 1024,
            Self::Xlarge => 8 * 1024,
            Self::Xlarge2 => 10 * 1024,
            Self::Xlarge8 => 40 * 1024,
        }
    }

    fn var_prefix(&self) -> &'static str {
        match self {
            Self::Nano => "SOME_ENV_VAR_NANO",
            Self::Micro => "SOME_ENV_VAR_MICRO",
            Self::Xsmall => "SOME_ENV_VAR_XSMALL",
            Self::Small => "SOME_ENV_VAR_SMALL",
            Self::Medium => "SOME_ENV_VAR_MEDIUM",
            Self::Large => "SOME_ENV_VAR_LARGE",
            Self::Xlarge => "SOME_ENV_VAR_XLARGE",
            Self::Xlarge2 => "SOME_ENV_VAR_XLARGE2",
            Self::Xlarge8 => "SOME_ENV_VAR_XLARGE8",
        }
    }
}

/// Sizing of the synthetic env vars attached to fabricated pods and jobs.
///
/// The env vars exist purely to pad the pod spec to a controllable size, so
/// object storage and API request payloads can be stressed independently of
/// object count.
#[derive(Debug, Clone)]
pub struct EnvVarsConfig {
    /// Number of env vars per pod spec.
    pub count: usize,
    /// Upper bound in bytes for one env var value when `random` is set.
    pub max_size: usize,
    /// Size class used when `random` is not set.
    pub kind: EnvVarsKind,
    /// Draw each pod's env var size uniformly from `[1, max_size]`.
    pub random: bool,
}

impl Default for EnvVarsConfig {
    fn default() -> Self {
        Self {
            count: 5,
            max_size: 10 * 1024,
            kind: EnvVarsKind::default(),
            random: false,
        }
    }
}

fn new_env_vars(config: &EnvVarsConfig) -> Vec<EnvVar> {
    let (prefix, size) = if config.random {
        let size = rand::thread_rng().gen_range(1..=config.max_size.max(1));
        ("SOME_ENV_VAR_RANDOM", size)
    } else {
        (config.kind.var_prefix(), config.kind.value_size())
    };
    (0..config.count)
        .map(|i| EnvVar {
            name: format!("{prefix}_{i}"),
            value: Some(utils::random_text(size)),
            ..Default::default()
        })
        .collect()
}

/// Create a fake node, managed by kwok, with the specified name.
pub fn new_fake_node(name: &str) -> Node {
    let resource_list: BTreeMap<String, Quantity> = BTreeMap::from_iter(vec![
        ("cpu".to_owned(), Quantity("20".to_owned())),
        ("memory".to_owned(), Quantity("256Gi".to_owned())),
        ("pods".to_owned(), Quantity("110".to_owned())),
    ]);
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            annotations: Some(BTreeMap::from_iter(vec![
                ("node.alpha.kubernetes.io/ttl".to_owned(), "0".to_owned()),
                (KWOK_NODE_ANNOTATION.to_owned(), "fake".to_owned()),
            ])),
            labels: Some(BTreeMap::from_iter(vec![
                ("beta.kubernetes.io/arch".to_owned(), "amd64".to_owned()),
                ("beta.kubernetes.io/os".to_owned(), "linux".to_owned()),
                ("kubernetes.io/arch".to_owned(), "amd64".to_owned()),
                ("kubernetes.io/hostname".to_owned(), name.to_owned()),
                ("kubernetes.io/os".to_owned(), "linux".to_owned()),
                ("kubernetes.io/role".to_owned(), "agent".to_owned()),
                ("node-role.kubernetes.io/agent".to_owned(), String::new()),
                ("type".to_owned(), "kwok".to_owned()),
            ])),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            pod_cidr: Some(POD_CIDR.to_owned()),
            pod_cidrs: Some(vec![POD_CIDR.to_owned()]),
            taints: Some(vec![Taint {
                key: KWOK_NODE_ANNOTATION.to_owned(),
                value: Some("fake".to_owned()),
                effect: "NoSchedule".to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            allocatable: Some(resource_list.clone()),
            capacity: Some(resource_list),
            node_info: Some(NodeSystemInfo {
                architecture: "amd64".to_owned(),
                kube_proxy_version: "fake".to_owned(),
                kubelet_version: "fake".to_owned(),
                operating_system: "linux".to_owned(),
                ..Default::default()
            }),
            phase: Some("Running".to_owned()),
            ..Default::default()
        }),
    }
}

/// Create a fake pod, managed by kwok, with the specified name and namespace.
pub fn new_fake_pod(name: &str, namespace: &str, env_vars: &EnvVarsConfig) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(fake_labels(LABEL_VALUE_FAKE_POD)),
            ..Default::default()
        },
        spec: Some(new_fake_pod_spec(env_vars)),
        ..Default::default()
    }
}

/// Create a fake job, managed by kwok, with the specified name and namespace.
pub fn new_fake_job(name: &str, namespace: &str, env_vars: &EnvVarsConfig) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(fake_labels(LABEL_VALUE_FAKE_JOB)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(30),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from_iter(vec![
                        (LABEL_KEY_APP.to_owned(), LABEL_VALUE_FAKE_POD.to_owned()),
                        ("part-of".to_owned(), LABEL_VALUE_FAKE_JOB.to_owned()),
                        ("created-by".to_owned(), utils::hostname().to_owned()),
                    ])),
                    ..Default::default()
                }),
                spec: Some(new_fake_pod_spec(env_vars)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn fake_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![
        (LABEL_KEY_APP.to_owned(), app.to_owned()),
        ("type".to_owned(), "kwok".to_owned()),
        ("created-by".to_owned(), utils::hostname().to_owned()),
    ])
}

// Pods never run, so the container image is a sentinel that is never pulled.
fn new_fake_pod_spec(env_vars: &EnvVarsConfig) -> PodSpec {
    PodSpec {
        restart_policy: Some("Never".to_owned()),
        affinity: Some(new_fake_node_affinity()),
        tolerations: Some(vec![Toleration {
            key: Some(KWOK_NODE_ANNOTATION.to_owned()),
            operator: Some("Exists".to_owned()),
            effect: Some("NoSchedule".to_owned()),
            ..Default::default()
        }]),
        containers: vec![Container {
            name: "fake-container".to_owned(),
            image: Some("fake-image".to_owned()),
            env: Some(new_env_vars(env_vars)),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from_iter(vec![(
                    "cpu".to_owned(),
                    Quantity("1".to_owned()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    }
}

// Restrict scheduling to nodes fabricated by the simulator.
fn new_fake_node_affinity() -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "type".to_owned(),
                        operator: "In".to_owned(),
                        values: Some(vec!["kwok".to_owned()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_node_carries_the_kwok_contract() {
        let node = new_fake_node("fake-node-abc12");

        let annotations = node.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["kwok.x-k8s.io/node"], "fake");
        let labels = node.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["type"], "kwok");
        assert_eq!(labels["kubernetes.io/hostname"], "fake-node-abc12");

        let spec = node.spec.as_ref().unwrap();
        assert_eq!(spec.pod_cidr.as_deref(), Some("10.233.1.0/24"));
        let taint = &spec.taints.as_ref().unwrap()[0];
        assert_eq!(taint.key, "kwok.x-k8s.io/node");
        assert_eq!(taint.value.as_deref(), Some("fake"));
        assert_eq!(taint.effect, "NoSchedule");

        let status = node.status.as_ref().unwrap();
        assert_eq!(status.phase.as_deref(), Some("Running"));
        for resources in [
            status.allocatable.as_ref().unwrap(),
            status.capacity.as_ref().unwrap(),
        ] {
            assert_eq!(resources["cpu"].0, "20");
            assert_eq!(resources["memory"].0, "256Gi");
            assert_eq!(resources["pods"].0, "110");
        }
    }

    #[test]
    fn fake_pod_tolerates_and_targets_fake_nodes() {
        let pod = new_fake_pod("fake-pod-abc12", "stress", &EnvVarsConfig::default());

        assert_eq!(pod.metadata.namespace.as_deref(), Some("stress"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app"], "fake-pod");
        assert_eq!(labels["type"], "kwok");
        assert!(!labels["created-by"].is_empty());

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let toleration = &spec.tolerations.as_ref().unwrap()[0];
        assert_eq!(toleration.key.as_deref(), Some("kwok.x-k8s.io/node"));
        assert_eq!(toleration.effect.as_deref(), Some("NoSchedule"));

        let requirement = &spec
            .affinity
            .as_ref()
            .unwrap()
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms[0]
            .match_expressions
            .as_ref()
            .unwrap()[0];
        assert_eq!(requirement.key, "type");
        assert_eq!(requirement.values.as_ref().unwrap(), &vec!["kwok".to_owned()]);

        let container = &spec.containers[0];
        assert_eq!(container.name, "fake-container");
        assert_eq!(container.image.as_deref(), Some("fake-image"));
    }

    #[test]
    fn fake_job_wraps_a_fake_pod_template() {
        let job = new_fake_job("fake-job-abc12", "stress", &EnvVarsConfig::default());

        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app"], "fake-job");
        assert_eq!(labels["type"], "kwok");

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.ttl_seconds_after_finished, Some(30));
        let template_labels = spec
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(template_labels["app"], "fake-pod");
        assert_eq!(template_labels["part-of"], "fake-job");
        assert_eq!(
            spec.template.spec.as_ref().unwrap().containers[0].image.as_deref(),
            Some("fake-image")
        );
    }

    #[test]
    fn env_vars_follow_the_size_class() {
        let config = EnvVarsConfig {
            count: 3,
            kind: EnvVarsKind::Small,
            ..Default::default()
        };
        let env = new_env_vars(&config);
        assert_eq!(env.len(), 3);
        for (i, var) in env.iter().enumerate() {
            assert_eq!(var.name, format!("SOME_ENV_VAR_SMALL_{i}"));
            assert_eq!(var.value.as_ref().unwrap().len(), 1024);
        }
    }

    #[test]
    fn random_env_vars_stay_within_the_cap() {
        let config = EnvVarsConfig {
            count: 4,
            max_size: 64,
            random: true,
            ..Default::default()
        };
        let env = new_env_vars(&config);
        assert_eq!(env.len(), 4);
        for var in &env {
            assert!(var.name.starts_with("SOME_ENV_VAR_RANDOM"));
            let len = var.value.as_ref().unwrap().len();
            assert!((1..=64).contains(&len), "unexpected size {len}");
        }
    }

    #[test]
    fn size_classes_map_to_documented_bytes() {
        for (name, size) in [
            ("nano", 100),
            ("micro", 200),
            ("xsmall", 500),
            ("small", 1024),
            ("medium", 2048),
            ("large", 4096),
            ("xlarge", 8192),
            ("xlarge2", 10240),
            ("xlarge8", 40960),
        ] {
            assert_eq!(EnvVarsKind::parse(name).value_size(), size);
            assert_eq!(EnvVarsKind::parse(name).name(), name);
        }
        // Unknown classes fall back to medium.
        assert_eq!(EnvVarsKind::parse("galactic"), EnvVarsKind::Medium);
    }
}
