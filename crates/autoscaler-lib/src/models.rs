//! Core data models for the autoscaler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ready-message count for one queue at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub message_count: u64,
    pub observed_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn now(message_count: u64) -> Self {
        Self {
            message_count,
            observed_at: Utc::now(),
        }
    }
}

/// Worker pods observed for a scaling group, derived on every poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub running: u32,
    pub pending: u32,
}

impl WorkerCounts {
    pub fn new(running: u32, pending: u32) -> Self {
        Self { running, pending }
    }

    pub fn total(&self) -> u32 {
        self.running + self.pending
    }

    /// Count pods by phase; terminated pods are not counted
    pub fn tally(phases: impl IntoIterator<Item = JobPhase>) -> Self {
        phases
            .into_iter()
            .fold(Self::default(), |mut counts, phase| {
                match phase {
                    JobPhase::Running => counts.running += 1,
                    JobPhase::Pending => counts.pending += 1,
                    JobPhase::Terminated => {}
                }
                counts
            })
    }
}

/// Lifecycle phase of a worker pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    /// Scheduled or starting, containers not ready yet
    Pending,
    /// All containers passed readiness
    Running,
    /// At least one container has exited
    Terminated,
}

/// State of one consumer session, published by its consume task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Consuming,
    /// The connection or channel dropped unexpectedly
    Reconnecting,
    /// The session was asked to stop and has released its resources
    Stopped,
}

impl SessionState {
    /// The session ended and wants a new one
    pub fn should_reconnect(&self) -> bool {
        matches!(self, SessionState::Reconnecting)
    }
}

/// Lifecycle phase of the worker process as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    Starting,
    Consuming,
    Reconnecting,
    Terminating,
    Stopped,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerPhase::Starting => "starting",
            WorkerPhase::Consuming => "consuming",
            WorkerPhase::Reconnecting => "reconnecting",
            WorkerPhase::Terminating => "terminating",
            WorkerPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
