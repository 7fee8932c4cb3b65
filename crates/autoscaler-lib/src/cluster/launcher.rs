//! Kubernetes-backed worker launcher

use super::manifest::{generate_job_name, worker_job, JobTemplate};
use super::{async_trait, pod_phase, ClusterJobLauncher};
use crate::error::ClusterError;
use crate::models::WorkerCounts;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

/// Launches worker jobs and counts their pods through the Kubernetes API
pub struct KubeJobLauncher {
    jobs: Api<Job>,
    pods: Api<Pod>,
    template: JobTemplate,
}

impl KubeJobLauncher {
    pub fn new(client: Client, template: JobTemplate) -> Self {
        Self {
            jobs: Api::namespaced(client.clone(), &template.namespace),
            pods: Api::namespaced(client, &template.namespace),
            template,
        }
    }

    /// Build a client from the in-cluster service account or the local
    /// kubeconfig, whichever is available
    pub async fn try_default(template: JobTemplate) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, template))
    }

    pub fn template(&self) -> &JobTemplate {
        &self.template
    }
}

#[async_trait]
impl ClusterJobLauncher for KubeJobLauncher {
    async fn count_workers(&self) -> Result<WorkerCounts, ClusterError> {
        let selector = self.template.label_selector();
        let jobs = self
            .jobs
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|source| ClusterError::List {
                selector: selector.clone(),
                source,
            })?;

        let mut counts = WorkerCounts::default();
        for job in jobs.items {
            let pod_selector = format!("job-name={}", job.name_any());
            let pods = self
                .pods
                .list(&ListParams::default().labels(&pod_selector))
                .await
                .map_err(|source| ClusterError::List {
                    selector: pod_selector.clone(),
                    source,
                })?;

            let job_counts = WorkerCounts::tally(pods.items.iter().map(pod_phase));
            counts.running += job_counts.running;
            counts.pending += job_counts.pending;
        }

        debug!(
            selector = %selector,
            running = counts.running,
            pending = counts.pending,
            "Counted worker pods"
        );
        Ok(counts)
    }

    async fn launch(&self, count: u32) -> Result<u32, ClusterError> {
        let mut created = 0u32;
        let mut last_error = None;

        for _ in 0..count {
            let name = generate_job_name(&self.template.worker_type);
            let job = worker_job(&name, &self.template);

            match self.jobs.create(&PostParams::default(), &job).await {
                Ok(_) => {
                    created += 1;
                    info!(job = %name, namespace = %self.template.namespace, "Created worker job");
                }
                Err(source) => {
                    let err = ClusterError::Create { name, source };
                    warn!(error = %err, "Error creating new worker job");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if created == 0 && count > 0 => Err(err),
            _ => Ok(created),
        }
    }
}
