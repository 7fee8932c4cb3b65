//! Observability infrastructure for the autoscaler and its workers
//!
//! Provides:
//! - Prometheus metrics for the scaling loop and the worker runtime
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for poll cycle latency (in seconds)
const POLL_LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static SCALER_METRICS: OnceLock<ScalerMetricsInner> = OnceLock::new();
static WORKER_METRICS: OnceLock<WorkerMetricsInner> = OnceLock::new();

struct ScalerMetricsInner {
    queue_depth: IntGauge,
    workers_running: IntGauge,
    workers_pending: IntGauge,
    jobs_launched: IntCounter,
    launch_errors: IntCounter,
    poll_errors: IntCounter,
    poll_latency_seconds: Histogram,
}

impl ScalerMetricsInner {
    fn new() -> Self {
        Self {
            queue_depth: register_int_gauge!(
                "queue_autoscaler_queue_depth",
                "Ready messages observed in the watched queue"
            )
            .expect("Failed to register queue_depth"),

            workers_running: register_int_gauge!(
                "queue_autoscaler_workers_running",
                "Worker pods with all containers ready"
            )
            .expect("Failed to register workers_running"),

            workers_pending: register_int_gauge!(
                "queue_autoscaler_workers_pending",
                "Worker pods not yet ready"
            )
            .expect("Failed to register workers_pending"),

            jobs_launched: register_int_counter!(
                "queue_autoscaler_jobs_launched_total",
                "Worker jobs created by the controller"
            )
            .expect("Failed to register jobs_launched"),

            launch_errors: register_int_counter!(
                "queue_autoscaler_launch_errors_total",
                "Failed worker job creations"
            )
            .expect("Failed to register launch_errors"),

            poll_errors: register_int_counter!(
                "queue_autoscaler_poll_errors_total",
                "Poll cycles that could not read the queue or the cluster"
            )
            .expect("Failed to register poll_errors"),

            poll_latency_seconds: register_histogram!(
                "queue_autoscaler_poll_latency_seconds",
                "Duration of one probe, count, decide and launch cycle",
                POLL_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register poll_latency_seconds"),
        }
    }
}

/// Scaling controller metrics
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ScalerMetrics {
    _private: (),
}

impl Default for ScalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalerMetrics {
    pub fn new() -> Self {
        SCALER_METRICS.get_or_init(ScalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScalerMetricsInner {
        SCALER_METRICS.get_or_init(ScalerMetricsInner::new)
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.inner()
            .queue_depth
            .set(saturating_i64(depth));
    }

    pub fn set_workers(&self, running: u32, pending: u32) {
        self.inner().workers_running.set(i64::from(running));
        self.inner().workers_pending.set(i64::from(pending));
    }

    pub fn add_jobs_launched(&self, count: u32) {
        self.inner().jobs_launched.inc_by(u64::from(count));
    }

    pub fn inc_launch_errors(&self) {
        self.inner().launch_errors.inc();
    }

    pub fn inc_poll_errors(&self) {
        self.inner().poll_errors.inc();
    }

    pub fn observe_poll_latency(&self, elapsed: Duration) {
        self.inner()
            .poll_latency_seconds
            .observe(elapsed.as_secs_f64());
    }
}

struct WorkerMetricsInner {
    messages_processed: IntCounter,
    handler_errors: IntCounter,
    reconnects: IntCounter,
    active_messages: IntGauge,
}

impl WorkerMetricsInner {
    fn new() -> Self {
        Self {
            messages_processed: register_int_counter!(
                "queue_worker_messages_processed_total",
                "Messages handled and acknowledged"
            )
            .expect("Failed to register messages_processed"),

            handler_errors: register_int_counter!(
                "queue_worker_handler_errors_total",
                "Messages whose handler returned an error"
            )
            .expect("Failed to register handler_errors"),

            reconnects: register_int_counter!(
                "queue_worker_reconnects_total",
                "Consumer sessions replaced after a broker failure"
            )
            .expect("Failed to register reconnects"),

            active_messages: register_int_gauge!(
                "queue_worker_active_messages",
                "Delivered but not yet acknowledged messages"
            )
            .expect("Failed to register active_messages"),
        }
    }
}

/// Worker runtime metrics
#[derive(Clone)]
pub struct WorkerMetrics {
    _private: (),
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerMetrics {
    pub fn new() -> Self {
        WORKER_METRICS.get_or_init(WorkerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &WorkerMetricsInner {
        WORKER_METRICS.get_or_init(WorkerMetricsInner::new)
    }

    pub fn inc_messages_processed(&self) {
        self.inner().messages_processed.inc();
    }

    pub fn inc_handler_errors(&self) {
        self.inner().handler_errors.inc();
    }

    pub fn inc_reconnects(&self) {
        self.inner().reconnects.inc();
    }

    pub fn set_active_messages(&self, count: usize) {
        self.inner()
            .active_messages
            .set(saturating_i64(count as u64));
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Structured logger for lifecycle events
///
/// Every record carries an `event` tag and the emitting instance so log
/// pipelines can follow one controller or one worker pod.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn log_autoscaler_startup(&self, version: &str, selector: &str) {
        info!(
            event = "autoscaler_started",
            instance = %self.instance,
            version = %version,
            selector = %selector,
            "Queue autoscaler started"
        );
    }

    pub fn log_autoscaler_shutdown(&self, reason: &str) {
        info!(
            event = "autoscaler_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Queue autoscaler shutting down"
        );
    }

    /// Log a scale-up decision with its inputs
    pub fn log_scale_up(
        &self,
        worker_type: &str,
        message_count: u64,
        running: u32,
        pending: u32,
        target_total: u32,
        reason: &str,
    ) {
        info!(
            event = "scale_up",
            instance = %self.instance,
            worker_type = %worker_type,
            message_count = message_count,
            num_workers_running = running,
            num_workers_pending = pending,
            num_workers_total = running.saturating_add(pending),
            num_workers_target = target_total,
            reason = %reason,
            "Scaling up workers"
        );
    }

    pub fn log_worker_startup(&self, version: &str, queue: &str, max_idle_seconds: u64) {
        info!(
            event = "worker_started",
            instance = %self.instance,
            version = %version,
            queue = %queue,
            max_idle_seconds = max_idle_seconds,
            "Worker started"
        );
    }

    pub fn log_reconnect(&self, delay: Duration, consecutive_failures: u32) {
        warn!(
            event = "worker_reconnecting",
            instance = %self.instance,
            delay_secs = delay.as_secs(),
            consecutive_failures = consecutive_failures,
            "Consumer session lost, reconnecting"
        );
    }

    pub fn log_idle_exit(&self, idle_for: Duration, max_idle_seconds: u64) {
        info!(
            event = "worker_idle_exit",
            instance = %self.instance,
            idle_secs = idle_for.as_secs(),
            max_idle_seconds = max_idle_seconds,
            "Stopping worker due to max idle time exceeded"
        );
    }

    pub fn log_worker_shutdown(&self, reason: &str, forced: bool) {
        if forced {
            warn!(
                event = "worker_shutdown",
                instance = %self.instance,
                reason = %reason,
                forced = true,
                "Cooperative shutdown did not complete, forcing exit"
            );
        } else {
            info!(
                event = "worker_shutdown",
                instance = %self.instance,
                reason = %reason,
                forced = false,
                "Worker shut down gracefully"
            );
        }
    }
}
