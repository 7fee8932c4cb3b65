//! In-flight message accounting shared by the consume task and the idle monitor

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct ActivityInner {
    active: AtomicUsize,
    /// Milliseconds since `origin` of the last activity
    last_active_ms: AtomicU64,
    origin: Instant,
}

/// Count of delivered but unacknowledged messages plus the time of the last
/// activity. Clones share the same cell.
///
/// The count is only changed through [`ActivityTracker::begin`] and the
/// [`InFlight`] guard it returns, so every delivery is counted once and
/// released once.
#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<ActivityInner>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// A tracker whose idle clock starts now
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ActivityInner {
                active: AtomicUsize::new(0),
                last_active_ms: AtomicU64::new(0),
                origin: Instant::now(),
            }),
        }
    }

    /// Count a new delivery. The count is raised before the activity stamp so
    /// an observer never sees zero in-flight work with a stale timestamp for a
    /// delivery that has already been received.
    pub fn begin(&self) -> InFlight {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        self.touch();
        InFlight {
            tracker: self.clone(),
            released: false,
        }
    }

    /// Record activity without changing the count
    pub fn touch(&self) {
        let elapsed = self.inner.origin.elapsed().as_millis();
        let elapsed = u64::try_from(elapsed).unwrap_or(u64::MAX);
        self.inner.last_active_ms.fetch_max(elapsed, Ordering::SeqCst);
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.inner.last_active_ms.load(Ordering::SeqCst));
        self.inner.origin.elapsed().saturating_sub(last)
    }

    fn release(&self) {
        self.touch();
        let _ = self
            .inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// One counted delivery; releases its count exactly once
pub struct InFlight {
    tracker: ActivityTracker,
    released: bool,
}

impl InFlight {
    /// Release the count after the message has been acknowledged
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.tracker.release();
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.release();
    }
}
