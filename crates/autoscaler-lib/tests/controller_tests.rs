//! Scaling controller tests against in-memory queue and cluster fakes

use autoscaler_lib::broker::QueueDepthSource;
use autoscaler_lib::cluster::{async_trait, ClusterJobLauncher};
use autoscaler_lib::health::components;
use autoscaler_lib::{
    BrokerError, ClusterError, ComponentStatus, HealthRegistry, ScaleReason, ScalingConfig,
    ScalingController, WorkerCounts,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

struct FakeQueue {
    depth: Mutex<Result<u64, BrokerError>>,
    calls: AtomicUsize,
}

impl FakeQueue {
    fn new(depth: u64) -> Arc<Self> {
        Arc::new(Self {
            depth: Mutex::new(Ok(depth)),
            calls: AtomicUsize::new(0),
        })
    }

    fn set(&self, depth: Result<u64, BrokerError>) {
        *self.depth.lock().unwrap() = depth;
    }
}

#[async_trait]
impl QueueDepthSource for FakeQueue {
    async fn message_count(&self) -> Result<u64, BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.depth.lock().unwrap().clone()
    }
}

fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "the server is unavailable".to_string(),
        reason: "ServiceUnavailable".to_string(),
        code,
    })
}

/// `None` counts make listing fail
struct FakeCluster {
    counts: Mutex<Option<WorkerCounts>>,
    fail_launch: Mutex<bool>,
    launched: Mutex<Vec<u32>>,
}

impl FakeCluster {
    fn new(running: u32, pending: u32) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(Some(WorkerCounts::new(running, pending))),
            fail_launch: Mutex::new(false),
            launched: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, counts: Option<WorkerCounts>) {
        *self.counts.lock().unwrap() = counts;
    }

    fn launched(&self) -> Vec<u32> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterJobLauncher for FakeCluster {
    async fn count_workers(&self) -> Result<WorkerCounts, ClusterError> {
        let counts = *self.counts.lock().unwrap();
        counts.ok_or_else(|| ClusterError::List {
            selector: "worker-type=test-worker,worker-group=group-a".to_string(),
            source: api_error(503),
        })
    }

    async fn launch(&self, count: u32) -> Result<u32, ClusterError> {
        if *self.fail_launch.lock().unwrap() {
            return Err(ClusterError::Create {
                name: "test-worker-aaaaaaaaaaaa".to_string(),
                source: api_error(403),
            });
        }
        self.launched.lock().unwrap().push(count);
        Ok(count)
    }
}

fn config() -> ScalingConfig {
    ScalingConfig {
        target_queue_size: 100,
        scale_increment: 20,
        check_trigger_interval_secs: 5,
        force_empty_queue_interval_ms: 5000,
        worker_type: "test-worker".to_string(),
        worker_group: "group-a".to_string(),
        image: "registry.local/test-worker:latest".to_string(),
        image_pull_policy: "IfNotPresent".to_string(),
        namespace: "default".to_string(),
    }
}

fn controller(queue: &Arc<FakeQueue>, cluster: &Arc<FakeCluster>) -> ScalingController {
    ScalingController::new(queue.clone(), cluster.clone(), config())
}

mod scale_up_tests {
    use super::*;

    #[tokio::test]
    async fn test_backlog_launches_increment() {
        let queue = FakeQueue::new(150);
        let cluster = FakeCluster::new(0, 0);
        let mut controller = controller(&queue, &cluster);

        let report = controller.poll_once().await;

        assert_eq!(report.decision.target_total, 20);
        assert_eq!(report.launched, 20);
        assert_eq!(cluster.launched(), vec![20]);
    }

    #[tokio::test]
    async fn test_backlog_adds_to_running_workers() {
        let queue = FakeQueue::new(150);
        let cluster = FakeCluster::new(5, 0);
        let mut controller = controller(&queue, &cluster);

        let report = controller.poll_once().await;

        assert_eq!(report.decision.target_total, 25);
        assert_eq!(cluster.launched(), vec![20]);
    }

    #[tokio::test]
    async fn test_pending_worker_blocks_second_scale_up() {
        let queue = FakeQueue::new(10_000);
        let cluster = FakeCluster::new(3, 1);
        let mut controller = controller(&queue, &cluster);

        let report = controller.poll_once().await;

        assert_eq!(report.decision.target_total, report.decision.total);
        assert!(cluster.launched().is_empty());
    }

    #[tokio::test]
    async fn test_small_backlog_at_startup_is_drained() {
        let queue = FakeQueue::new(3);
        let cluster = FakeCluster::new(0, 0);
        let mut controller = controller(&queue, &cluster);

        let report = controller.poll_once().await;

        assert_eq!(report.decision.reason, ScaleReason::ForceDrain);
        assert_eq!(cluster.launched(), vec![20]);
    }
}

mod force_drain_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_force_drain_after_last_worker_leaves() {
        let queue = FakeQueue::new(0);
        let cluster = FakeCluster::new(1, 0);
        let mut controller = controller(&queue, &cluster);

        // a running worker resets the idle clock
        controller.poll_once().await;
        assert!(controller.idle_for() < Duration::from_secs(1));

        queue.set(Ok(3));
        cluster.set(Some(WorkerCounts::default()));

        tokio::time::advance(Duration::from_millis(4000)).await;
        let report = controller.poll_once().await;
        assert_eq!(report.launched, 0);

        tokio::time::advance(Duration::from_millis(1001)).await;
        let report = controller.poll_once().await;
        assert_eq!(report.decision.reason, ScaleReason::ForceDrain);
        assert_eq!(report.decision.target_total, 20);
        assert_eq!(cluster.launched(), vec![20]);
    }
}

mod degraded_dependency_tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_failure_counts_as_empty_queue() {
        let queue = FakeQueue::new(0);
        queue.set(Err(BrokerError::Transient("channel closed".to_string())));
        let cluster = FakeCluster::new(0, 0);
        let health = HealthRegistry::new();
        let mut controller = controller(&queue, &cluster).with_health(health.clone());

        let report = controller.poll_once().await;

        assert_eq!(report.input.message_count, 0);
        assert!(cluster.launched().is_empty());

        let status = health.health().await;
        assert_eq!(
            status.components[components::QUEUE_PROBE].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_cluster_failure_uses_last_known_counts() {
        let queue = FakeQueue::new(50);
        let cluster = FakeCluster::new(2, 1);
        let health = HealthRegistry::new();
        let mut controller = controller(&queue, &cluster).with_health(health.clone());

        controller.poll_once().await;

        queue.set(Ok(500));
        cluster.set(None);
        let report = controller.poll_once().await;

        // the pending worker seen last time still holds back a scale-up
        assert_eq!(report.input.counts, WorkerCounts::new(2, 1));
        assert!(cluster.launched().is_empty());
        assert_eq!(
            health.health().await.components[components::CLUSTER].status,
            ComponentStatus::Degraded
        );

        cluster.set(Some(WorkerCounts::new(2, 0)));
        let report = controller.poll_once().await;
        assert_eq!(report.launched, 20);
        assert_eq!(
            health.health().await.components[components::CLUSTER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_launch_failure_does_not_stop_cycle() {
        let queue = FakeQueue::new(150);
        let cluster = FakeCluster::new(0, 0);
        *cluster.fail_launch.lock().unwrap() = true;
        let mut controller = controller(&queue, &cluster);

        let report = controller.poll_once().await;

        assert_eq!(report.decision.target_total, 20);
        assert_eq!(report.launched, 0);
    }
}

mod loop_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_loop_polls_on_interval_until_shutdown() {
        let queue = FakeQueue::new(0);
        let cluster = FakeCluster::new(0, 0);
        let health = HealthRegistry::new();
        let controller = controller(&queue, &cluster).with_health(health.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(controller.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(health.readiness().await.ready);

        // ticks at 0, 5 and 10 seconds
        tokio::time::sleep(Duration::from_secs(11)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(queue.calls.load(Ordering::SeqCst), 3);
        assert!(!health.readiness().await.ready);
        assert_eq!(
            health.health().await.components[components::CONTROLLER].status,
            ComponentStatus::Unhealthy
        );
    }
}
