//! Restart budget for servers that exit unexpectedly.
//!
//! # Policy
//!
//! - At most `max_attempts` restarts inside one burst of failures.
//! - A failure arriving after `cooldown` of quiet resets the count.
//! - Each restart waits a fixed `backoff` before relaunching.

use std::time::{Duration, Instant};

use crate::types::SessionOptions;

#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_attempts: u32,
    cooldown: Duration,
    backoff: Duration,
    attempts: u32,
    last_failure: Option<Instant>,
}

impl RestartBudget {
    #[must_use]
    pub fn new(max_attempts: u32, cooldown: Duration, backoff: Duration) -> Self {
        Self {
            max_attempts,
            cooldown,
            backoff,
            attempts: 0,
            last_failure: None,
        }
    }

    #[must_use]
    pub fn from_options(options: &SessionOptions) -> Self {
        Self::new(
            options.restart_max_attempts,
            options.restart_cooldown(),
            options.restart_backoff(),
        )
    }

    /// Record an unexpected exit at `now`.
    ///
    /// Returns when the restart should happen, or `None` once the budget
    /// is exhausted.
    pub fn on_failure(&mut self, now: Instant) -> Option<Instant> {
        if let Some(last) = self.last_failure
            && now.saturating_duration_since(last) >= self.cooldown
        {
            tracing::debug!(attempts = self.attempts, "Restart budget replenished after cooldown");
            self.attempts = 0;
        }
        self.last_failure = Some(now);
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(now + self.backoff)
    }

    /// Restarts used in the current burst.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}
