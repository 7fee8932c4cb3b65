//! Health of the autoscaler's dependencies
//!
//! The controller reports the queue probe and the cluster API as degraded
//! while they fail and healthy again once they answer. It marks itself
//! ready after its first completed cycle and unhealthy once its loop stops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component names for health tracking
pub mod components {
    pub const QUEUE_PROBE: &str = "queue_probe";
    pub const CLUSTER: &str = "cluster";
    pub const CONTROLLER: &str = "controller";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Failing, but the scaling loop carries on with fallback values
    Degraded,
    /// The scaler cannot make decisions
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Consecutive failed reports, reset by a healthy one
    #[serde(default)]
    pub consecutive_failures: u32,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>, consecutive_failures: u32) -> Self {
        Self {
            status,
            message,
            consecutive_failures,
            checked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status across all components
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    components: HashMap<String, ComponentHealth>,
    ready: bool,
}

/// Shared component health; clones see the same state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a component as healthy
    pub async fn register(&self, name: &str) {
        self.report(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_healthy(&self, name: &str) {
        self.report(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.state.read().await.components.get(name).cloned()
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);

        HealthResponse {
            status,
            components: state.components.clone(),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = self.state.read().await.ready;
        let health = self.health().await;

        let reason = if !ready {
            Some("No scaling cycle completed yet".to_string())
        } else if health.status == ComponentStatus::Unhealthy {
            Some("Critical component unhealthy".to_string())
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }

    async fn report(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut state = self.state.write().await;
        let failures = match status {
            ComponentStatus::Healthy => 0,
            _ => state
                .components
                .get(name)
                .map_or(0, |c| c.consecutive_failures)
                .saturating_add(1),
        };
        state
            .components
            .insert(name.to_string(), ComponentHealth::new(status, message, failures));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy_but_not_ready() {
        let registry = HealthRegistry::new();

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::QUEUE_PROBE).await;
        registry.register(components::CLUSTER).await;
        registry.register(components::CONTROLLER).await;

        registry
            .set_degraded(components::QUEUE_PROBE, "queue depth unavailable")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::CONTROLLER, "scaling loop stopped")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_failures_accumulate_until_recovery() {
        let registry = HealthRegistry::new();
        registry.register(components::CLUSTER).await;

        registry.set_degraded(components::CLUSTER, "list jobs failed").await;
        registry.set_degraded(components::CLUSTER, "list jobs failed").await;
        let cluster = registry.component(components::CLUSTER).await.unwrap();
        assert_eq!(cluster.consecutive_failures, 2);
        assert_eq!(cluster.message.as_deref(), Some("list jobs failed"));

        registry.set_healthy(components::CLUSTER).await;
        let cluster = registry.component(components::CLUSTER).await.unwrap();
        assert_eq!(cluster.status, ComponentStatus::Healthy);
        assert_eq!(cluster.consecutive_failures, 0);
        assert!(cluster.message.is_none());
    }

    #[tokio::test]
    async fn test_ready_unless_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::QUEUE_PROBE).await;
        registry.set_ready(true).await;

        registry.set_degraded(components::QUEUE_PROBE, "channel closed").await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::QUEUE_PROBE, "broker refused connection")
            .await;
        assert!(!registry.readiness().await.ready);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ComponentStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
