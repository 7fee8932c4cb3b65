//! Idle monitor
//!
//! Polls the activity tracker and raises the worker's terminating flag once
//! no message has been in flight for longer than the configured idle limit.
//! The flag is sticky; the supervisory loop decides when it is safe to act.

use super::activity::ActivityTracker;
use crate::observability::StructuredLogger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// True when nothing is in flight and the last activity is older than `max_idle`
pub fn idle_expired(tracker: &ActivityTracker, max_idle: Duration) -> bool {
    tracker.active() == 0 && tracker.idle_for() > max_idle
}

#[derive(Clone)]
pub(crate) struct IdleSettings {
    pub max_idle: Duration,
    pub poll_interval: Duration,
}

pub(crate) struct IdleMonitor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IdleMonitor {
    pub(crate) fn spawn(
        settings: IdleSettings,
        tracker: ActivityTracker,
        terminating: Arc<AtomicBool>,
        logger: StructuredLogger,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(monitor(settings, tracker, terminating, logger, stop_rx));
        Self { stop, task }
    }

    /// The monitor loop ended, either after raising the flag or by panicking
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the monitor to stop and wait up to `grace`. Returns false if the
    /// task had to be aborted.
    pub(crate) async fn stop(mut self, grace: Duration) -> bool {
        let _ = self.stop.send(true);
        match timeout(grace, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Idle monitor ended abnormally");
                true
            }
            Err(_) => {
                self.task.abort();
                false
            }
        }
    }

    /// Log why a finished monitor ended
    pub(crate) async fn reap(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Idle monitor crashed");
        }
    }
}

async fn monitor(
    settings: IdleSettings,
    tracker: ActivityTracker,
    terminating: Arc<AtomicBool>,
    logger: StructuredLogger,
    mut stop: watch::Receiver<bool>,
) {
    debug!(
        max_idle_secs = settings.max_idle.as_secs(),
        "Idle monitor started"
    );

    loop {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return,
            _ = sleep(settings.poll_interval) => {}
        }

        if idle_expired(&tracker, settings.max_idle) {
            logger.log_idle_exit(tracker.idle_for(), settings.max_idle.as_secs());
            terminating.store(true, Ordering::SeqCst);
            return;
        }
    }
}
