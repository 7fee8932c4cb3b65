//! Pod phase derivation

use crate::models::JobPhase;
use k8s_openapi::api::core::v1::Pod;

const CONTAINERS_READY: &str = "ContainersReady";

/// Derive the phase of a worker pod.
///
/// Terminated if any container has a terminated state, otherwise Running if
/// the `ContainersReady` condition is true, otherwise Pending.
pub fn pod_phase(pod: &Pod) -> JobPhase {
    let Some(status) = pod.status.as_ref() else {
        return JobPhase::Pending;
    };

    let terminated = status
        .container_statuses
        .iter()
        .flatten()
        .any(|cs| cs.state.as_ref().is_some_and(|s| s.terminated.is_some()));
    if terminated {
        return JobPhase::Terminated;
    }

    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == CONTAINERS_READY && c.status == "True");
    if ready {
        JobPhase::Running
    } else {
        JobPhase::Pending
    }
}
