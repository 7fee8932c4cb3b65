//! Worker job manifest

use crate::config::ScalingConfig;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PodSpec, PodTemplateSpec, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::Rng;
use std::collections::BTreeMap;

pub const LABEL_WORKER_TYPE: &str = "worker-type";
pub const LABEL_WORKER_GROUP: &str = "worker-group";

/// Node label and taint key isolating a scaling group on its own capacity
const NODE_GROUP_KEY: &str = "worker_group";

const NAME_SUFFIX_LEN: usize = 12;
const NAME_SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Fields that vary between scaling groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTemplate {
    pub worker_type: String,
    pub worker_group: String,
    pub image: String,
    pub image_pull_policy: String,
    pub namespace: String,
}

impl From<&ScalingConfig> for JobTemplate {
    fn from(config: &ScalingConfig) -> Self {
        Self {
            worker_type: config.worker_type.clone(),
            worker_group: config.worker_group.clone(),
            image: config.image.clone(),
            image_pull_policy: config.image_pull_policy.clone(),
            namespace: config.namespace.clone(),
        }
    }
}

impl JobTemplate {
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_WORKER_TYPE.to_string(), self.worker_type.clone()),
            (LABEL_WORKER_GROUP.to_string(), self.worker_group.clone()),
        ])
    }

    /// Selector matching the labels this template stamps on its jobs
    pub fn label_selector(&self) -> String {
        format!(
            "{}={},{}={}",
            LABEL_WORKER_TYPE, self.worker_type, LABEL_WORKER_GROUP, self.worker_group
        )
    }
}

/// `<worker_type>-<12 random [a-z0-9]>`
pub fn generate_job_name(worker_type: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_SUFFIX_CHARS[rng.gen_range(0..NAME_SUFFIX_CHARS.len())] as char)
        .collect();
    format!("{}-{}", worker_type, suffix)
}

/// Build the job for one worker.
///
/// Failed workers are never restarted in place and finished jobs are removed
/// immediately; the controller relaunches capacity if backlog persists.
pub fn worker_job(name: &str, template: &JobTemplate) -> Job {
    let labels = template.labels();

    let container = Container {
        name: template.worker_type.clone(),
        image: Some(template.image.clone()),
        image_pull_policy: Some(template.image_pull_policy.clone()),
        ..Container::default()
    };

    let affinity = Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: NODE_GROUP_KEY.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![template.worker_group.clone()]),
                    }]),
                    ..NodeSelectorTerm::default()
                }],
            }),
            ..NodeAffinity::default()
        }),
        ..Affinity::default()
    };

    let toleration = Toleration {
        effect: Some("NoSchedule".to_string()),
        key: Some(NODE_GROUP_KEY.to_string()),
        operator: Some("Equal".to_string()),
        value: Some(template.worker_group.clone()),
        ..Toleration::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(template.namespace.clone()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    affinity: Some(affinity),
                    tolerations: Some(vec![toleration]),
                    restart_policy: Some("Never".to_string()),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}
