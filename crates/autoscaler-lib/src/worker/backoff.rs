//! Reconnect delay for consumer sessions

use std::time::Duration;

/// Upper bound on the reconnect delay, in seconds
pub const MAX_RECONNECT_DELAY_SECS: u64 = 30;

/// Linear, capped reconnect backoff.
///
/// A session that reached `Consuming` resets the delay to zero; every session
/// that failed before consuming adds one second, up to
/// [`MAX_RECONNECT_DELAY_SECS`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectBackoff {
    delay_seconds: u64,
    consecutive_failures: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait before the next session, given how the last one ended
    pub fn next_delay(&mut self, was_consuming: bool) -> Duration {
        if was_consuming {
            self.delay_seconds = 0;
            self.consecutive_failures = 0;
        } else {
            self.delay_seconds = (self.delay_seconds + 1).min(MAX_RECONNECT_DELAY_SECS);
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        Duration::from_secs(self.delay_seconds)
    }

    pub fn delay_seconds(&self) -> u64 {
        self.delay_seconds
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
