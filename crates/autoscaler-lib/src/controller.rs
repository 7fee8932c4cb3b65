//! Scaling decision loop
//!
//! Once per check interval the controller reads the queue depth and the
//! worker pod counts, decides how many workers the group should have and
//! launches the difference. It only ever scales up: capacity shrinks when
//! workers exit on their own after idling.

use crate::broker::QueueDepthSource;
use crate::cluster::ClusterJobLauncher;
use crate::config::ScalingConfig;
use crate::health::{components, HealthRegistry};
use crate::models::WorkerCounts;
use crate::observability::{ScalerMetrics, StructuredLogger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Idle time credited at start-up, so a small backlog left behind by a
/// previous controller is drained without waiting a full force interval
pub const STARTUP_IDLE_CREDIT: Duration = Duration::from_secs(300);

/// Everything the decision depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionInput {
    pub message_count: u64,
    pub counts: WorkerCounts,
    /// Time since a running worker was last observed
    pub idle_for: Duration,
}

/// Why a decision was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleReason {
    /// Backlog above target and nothing already starting
    Backlog,
    /// Small backlog left with zero workers for too long
    ForceDrain,
    /// No change
    Steady,
}

impl ScaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleReason::Backlog => "backlog",
            ScaleReason::ForceDrain => "force_drain",
            ScaleReason::Steady => "steady",
        }
    }
}

/// Outcome of one decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleDecision {
    pub total: u32,
    pub target_total: u32,
    pub reason: ScaleReason,
}

impl ScaleDecision {
    /// Jobs to create; never negative
    pub fn delta(&self) -> u32 {
        self.target_total.saturating_sub(self.total)
    }
}

/// Decide the target worker count. First matching rule wins.
pub fn decide(input: &DecisionInput, config: &ScalingConfig) -> ScaleDecision {
    let total = input.counts.total();
    let scaled = total.saturating_add(config.scale_increment);

    let (target_total, reason) = if input.counts.pending == 0
        && input.message_count > config.target_queue_size
    {
        (scaled, ScaleReason::Backlog)
    } else if input.message_count > 0
        && total < 1
        && input.idle_for > config.force_empty_queue_interval()
    {
        (scaled, ScaleReason::ForceDrain)
    } else {
        (total, ScaleReason::Steady)
    };

    ScaleDecision {
        total,
        target_total,
        reason,
    }
}

/// Result of one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub input: DecisionInput,
    pub decision: ScaleDecision,
    pub launched: u32,
}

/// Periodic scaling control loop for one worker group
pub struct ScalingController {
    probe: Arc<dyn QueueDepthSource>,
    launcher: Arc<dyn ClusterJobLauncher>,
    config: ScalingConfig,
    started_at: Instant,
    /// Last time at least one running worker was observed
    last_active: Option<Instant>,
    /// Counts from the last successful cluster query
    last_counts: WorkerCounts,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl ScalingController {
    pub fn new(
        probe: Arc<dyn QueueDepthSource>,
        launcher: Arc<dyn ClusterJobLauncher>,
        config: ScalingConfig,
    ) -> Self {
        let logger = StructuredLogger::new(format!("autoscaler/{}", config.worker_type));
        Self {
            probe,
            launcher,
            config,
            started_at: Instant::now(),
            last_active: None,
            last_counts: WorkerCounts::default(),
            metrics: ScalerMetrics::new(),
            logger,
            health: None,
        }
    }

    /// Report probe and cluster failures to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    /// Time since a running worker was last seen, including the start-up credit
    pub fn idle_for(&self) -> Duration {
        match self.last_active {
            Some(at) => at.elapsed(),
            None => self.started_at.elapsed() + STARTUP_IDLE_CREDIT,
        }
    }

    /// Run until a shutdown signal arrives. Cycles never overlap; a slow
    /// cycle delays the next tick instead of bunching them up.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.check_trigger_interval_secs,
            selector = %self.config.label_selector(),
            "Starting scaling loop"
        );

        let mut ticker = interval(self.config.check_trigger_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                    if let Some(health) = &self.health {
                        health.set_healthy(components::CONTROLLER).await;
                        health.set_ready(true).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down scaling loop");
                    break;
                }
            }
        }

        if let Some(health) = &self.health {
            health.set_ready(false).await;
            health
                .set_unhealthy(components::CONTROLLER, "scaling loop stopped")
                .await;
        }
    }

    /// Probe, count, decide and launch once
    pub async fn poll_once(&mut self) -> CycleReport {
        let start = Instant::now();

        let message_count = self.read_queue_depth().await;
        let counts = self.read_worker_counts().await;

        if counts.running > 0 {
            self.last_active = Some(Instant::now());
        }

        let input = DecisionInput {
            message_count,
            counts,
            idle_for: self.idle_for(),
        };
        let decision = decide(&input, &self.config);

        debug!(
            message_count,
            running = counts.running,
            pending = counts.pending,
            idle_ms = input.idle_for.as_millis() as u64,
            target_total = decision.target_total,
            reason = decision.reason.as_str(),
            "Scaling decision"
        );

        let launched = if decision.delta() > 0 {
            self.scale_up(&input, &decision).await
        } else {
            0
        };

        self.metrics.observe_poll_latency(start.elapsed());

        CycleReport {
            input,
            decision,
            launched,
        }
    }

    async fn read_queue_depth(&self) -> u64 {
        match self.probe.snapshot().await {
            Ok(snapshot) => {
                self.metrics.set_queue_depth(snapshot.message_count);
                self.set_component_healthy(components::QUEUE_PROBE).await;
                snapshot.message_count
            }
            Err(e) => {
                warn!(
                    error = %e,
                    worker_type = %self.config.worker_type,
                    "Error getting message count, assuming empty queue for this cycle"
                );
                self.metrics.inc_poll_errors();
                self.set_component_degraded(components::QUEUE_PROBE, e.to_string())
                    .await;
                0
            }
        }
    }

    async fn read_worker_counts(&mut self) -> WorkerCounts {
        match self.launcher.count_workers().await {
            Ok(counts) => {
                self.last_counts = counts;
                self.metrics.set_workers(counts.running, counts.pending);
                self.set_component_healthy(components::CLUSTER).await;
                counts
            }
            Err(e) => {
                warn!(
                    error = %e,
                    label_selector = %self.config.label_selector(),
                    last_running = self.last_counts.running,
                    last_pending = self.last_counts.pending,
                    "Error getting workers count, using last known counts"
                );
                self.metrics.inc_poll_errors();
                self.set_component_degraded(components::CLUSTER, e.to_string())
                    .await;
                self.last_counts
            }
        }
    }

    async fn scale_up(&self, input: &DecisionInput, decision: &ScaleDecision) -> u32 {
        let delta = decision.delta();
        self.logger.log_scale_up(
            &self.config.worker_type,
            input.message_count,
            input.counts.running,
            input.counts.pending,
            decision.target_total,
            decision.reason.as_str(),
        );

        match self.launcher.launch(delta).await {
            Ok(created) => {
                self.metrics.add_jobs_launched(created);
                if created < delta {
                    warn!(
                        requested = delta,
                        created,
                        "Some worker jobs could not be created"
                    );
                    self.metrics.inc_launch_errors();
                }
                created
            }
            Err(e) => {
                warn!(
                    error = %e,
                    requested = delta,
                    label_selector = %self.config.label_selector(),
                    "Error creating worker jobs"
                );
                self.metrics.inc_launch_errors();
                self.set_component_degraded(components::CLUSTER, e.to_string())
                    .await;
                0
            }
        }
    }

    async fn set_component_healthy(&self, name: &str) {
        if let Some(health) = &self.health {
            health.set_healthy(name).await;
        }
    }

    async fn set_component_degraded(&self, name: &str, message: String) {
        if let Some(health) = &self.health {
            health.set_degraded(name, message).await;
        }
    }
}
