//! Orchestrator access for counting and launching worker jobs
//!
//! This module provides:
//! - Pod phase derivation from Kubernetes status fields
//! - The worker job manifest
//! - A `kube`-backed launcher

mod launcher;
mod manifest;
mod phase;

pub use launcher::KubeJobLauncher;
pub use manifest::{generate_job_name, worker_job, JobTemplate, LABEL_WORKER_GROUP, LABEL_WORKER_TYPE};
pub use phase::pod_phase;

use crate::error::ClusterError;
use crate::models::WorkerCounts;

pub use async_trait::async_trait;

/// Counts and creates worker jobs for one scaling group
#[async_trait]
pub trait ClusterJobLauncher: Send + Sync {
    /// Running and pending worker pods for the group, counted by pod
    async fn count_workers(&self) -> Result<WorkerCounts, ClusterError>;

    /// Create `count` new worker jobs, returning how many were created
    async fn launch(&self, count: u32) -> Result<u32, ClusterError>;
}
