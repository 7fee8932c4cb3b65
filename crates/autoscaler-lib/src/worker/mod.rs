//! Worker runtime
//!
//! Runs one consumer session at a time, replaces it with backoff when the
//! broker drops it, and shuts the worker down after an idle period or on an
//! external interrupt. Shutdown is cooperative: the consume task stops at its
//! next safe point and every wait is bounded by the configured grace period.
//! A [`ShutdownOutcome::Forced`] result means some task had to be aborted and
//! the caller should exit the process without waiting for anything else.

mod activity;
mod backoff;
mod handler;
mod idle;
mod session;


pub use activity::{ActivityTracker, InFlight};
pub use backoff::{ReconnectBackoff, MAX_RECONNECT_DELAY_SECS};
pub use handler::{MessageHandler, NoopHandler};
pub use idle::idle_expired;

use crate::broker::{BindingSpec, MessageConsumer};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::models::{SessionState, WorkerPhase};
use crate::observability::{StructuredLogger, WorkerMetrics};
use idle::{IdleMonitor, IdleSettings};
use session::{SessionContext, SessionHandle, SessionJoin};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

/// How the worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every task acknowledged the stop within the grace period
    Graceful,
    /// At least one task was aborted after the grace period
    Forced,
}

/// Why the supervisory loop ended
#[derive(Debug, Clone, Copy)]
enum StopReason {
    Idle,
    Interrupted,
}

impl StopReason {
    fn as_str(&self) -> &'static str {
        match self {
            StopReason::Idle => "idle",
            StopReason::Interrupted => "interrupt",
        }
    }
}

pub struct WorkerRuntime {
    session: SessionContext,
    config: WorkerConfig,
    terminating: Arc<AtomicBool>,
    phase: watch::Sender<WorkerPhase>,
    metrics: WorkerMetrics,
    logger: StructuredLogger,
}

impl WorkerRuntime {
    pub fn new(
        consumer: Arc<dyn MessageConsumer>,
        handler: Arc<dyn MessageHandler>,
        binding: BindingSpec,
        config: WorkerConfig,
        logger: StructuredLogger,
    ) -> Self {
        let metrics = WorkerMetrics::new();
        let (phase, _) = watch::channel(WorkerPhase::Starting);
        Self {
            session: SessionContext {
                consumer,
                handler,
                binding,
                tracker: ActivityTracker::new(),
                metrics: metrics.clone(),
            },
            config,
            terminating: Arc::new(AtomicBool::new(false)),
            phase,
            metrics,
            logger,
        }
    }

    /// Shared view of in-flight work and the idle clock
    pub fn activity(&self) -> ActivityTracker {
        self.session.tracker.clone()
    }

    /// Follow the worker's lifecycle phase
    pub fn subscribe_phase(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Run until the worker idles out, `interrupt` resolves, or the broker
    /// rejects the first connection outright. Once a session has consumed,
    /// refused connections are retried with backoff like any other failure.
    pub async fn run<F>(self, interrupt: F) -> Result<ShutdownOutcome, WorkerError>
    where
        F: Future<Output = ()>,
    {
        self.logger.log_worker_startup(
            env!("CARGO_PKG_VERSION"),
            &self.session.binding.queue.name,
            self.config.max_idle_seconds,
        );
        tokio::pin!(interrupt);

        let mut monitor = self.spawn_idle_monitor();
        let mut session = Some(SessionHandle::spawn(self.session.clone()));
        let mut backoff = ReconnectBackoff::new();
        let mut has_consumed = false;

        let mut ticker = interval(self.config.supervise_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = &mut interrupt => break StopReason::Interrupted,
                _ = ticker.tick() => {}
            }

            if self.is_terminating() {
                self.set_phase(WorkerPhase::Terminating);
                let active = self.session.tracker.active();
                if active == 0 {
                    break StopReason::Idle;
                }
                info!(active, "Idle limit reached with messages in flight, waiting");
                continue;
            }

            if !self.is_terminating() && monitor.as_ref().is_some_and(IdleMonitor::is_finished) {
                // ended without raising the flag
                if let Some(finished) = monitor.take() {
                    finished.reap().await;
                }
                warn!("Restarting idle monitor");
                monitor = self.spawn_idle_monitor();
            }

            let Some(mut current) = session.take() else {
                session = Some(SessionHandle::spawn(self.session.clone()));
                continue;
            };

            if !current.has_ended() {
                if current.state() == SessionState::Consuming {
                    has_consumed = true;
                    self.set_phase(WorkerPhase::Consuming);
                }
                session = Some(current);
                continue;
            }

            self.set_phase(WorkerPhase::Reconnecting);
            let joined = tokio::select! {
                _ = &mut interrupt => None,
                joined = current.join(self.config.shutdown_grace()) => Some(joined),
            };
            let Some(joined) = joined else {
                session = Some(current);
                break StopReason::Interrupted;
            };

            let was_consuming = match &joined {
                SessionJoin::Finished(Err(e)) if e.is_fatal() && !has_consumed => {
                    error!(error = %e, "Broker refused the consumer, giving up");
                    self.stop_monitor(monitor).await;
                    self.set_phase(WorkerPhase::Stopped);
                    return Err(WorkerError::Broker(e.clone()));
                }
                SessionJoin::Finished(Err(e)) => {
                    warn!(error = %e, "Broker refused the consumer, retrying");
                    false
                }
                SessionJoin::Crashed(e) => {
                    warn!(error = %e, "Consume task crashed");
                    false
                }
                SessionJoin::TimedOut => {
                    warn!("Consume task did not end in time and was aborted");
                    false
                }
                other => other.was_consuming(),
            };
            has_consumed |= was_consuming;

            let delay = backoff.next_delay(was_consuming);
            self.metrics.inc_reconnects();
            self.logger
                .log_reconnect(delay, backoff.consecutive_failures());

            tokio::select! {
                _ = &mut interrupt => break StopReason::Interrupted,
                _ = sleep(delay) => {}
            }

            self.set_phase(WorkerPhase::Starting);
            session = Some(SessionHandle::spawn(self.session.clone()));
        };

        self.set_phase(WorkerPhase::Terminating);
        let outcome = self.shutdown(session, monitor).await;
        self.logger
            .log_worker_shutdown(reason.as_str(), outcome == ShutdownOutcome::Forced);
        self.set_phase(WorkerPhase::Stopped);
        Ok(outcome)
    }

    async fn shutdown(
        &self,
        session: Option<SessionHandle>,
        monitor: Option<IdleMonitor>,
    ) -> ShutdownOutcome {
        let grace = self.config.shutdown_grace();
        let mut forced = false;

        if let Some(session) = session {
            match session.stop(grace).await {
                SessionJoin::Finished(Ok(_)) => {}
                SessionJoin::Finished(Err(e)) => {
                    warn!(error = %e, "Consumer session failed while stopping");
                }
                SessionJoin::Crashed(e) => {
                    warn!(error = %e, "Consume task crashed while stopping");
                }
                SessionJoin::TimedOut => {
                    error!(
                        grace_secs = grace.as_secs(),
                        "Consume task did not stop within the grace period"
                    );
                    forced = true;
                }
            }
        }

        if !self.stop_monitor(monitor).await {
            error!("Idle monitor did not stop within the grace period");
            forced = true;
        }

        if forced {
            ShutdownOutcome::Forced
        } else {
            ShutdownOutcome::Graceful
        }
    }

    fn spawn_idle_monitor(&self) -> Option<IdleMonitor> {
        if !self.config.idle_exit_enabled() {
            return None;
        }
        Some(IdleMonitor::spawn(
            IdleSettings {
                max_idle: self.config.max_idle(),
                poll_interval: self.config.idle_poll_interval(),
            },
            self.session.tracker.clone(),
            self.terminating.clone(),
            self.logger.clone(),
        ))
    }

    async fn stop_monitor(&self, monitor: Option<IdleMonitor>) -> bool {
        match monitor {
            Some(monitor) => monitor.stop(self.config.shutdown_grace()).await,
            None => true,
        }
    }

    fn set_phase(&self, next: WorkerPhase) {
        if *self.phase.borrow() != next {
            self.phase.send_replace(next);
        }
    }
}
