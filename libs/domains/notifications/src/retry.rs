//! Retry policy for transient delivery failures.
//!
//! Backoff doubles per attempt from `base_delay`, capped at `max_delay`.
//! With jitter enabled the delay is drawn uniformly from the upper half of
//! that value (equal jitter), so retries of many recipients spread out while
//! never waiting less than half the nominal backoff.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum transport invocations per task, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total time budget per task, measured from enqueue.
    pub max_elapsed: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(600),
            jitter: true,
        }
    }
}

/// Why a transient failure is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    AttemptsExhausted,
    BudgetExhausted,
}

impl std::fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GiveUpReason::AttemptsExhausted => write!(f, "retry attempts exhausted"),
            GiveUpReason::BudgetExhausted => write!(f, "retry time budget exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(GiveUpReason),
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Nominal backoff after the `attempts`-th failed attempt, before jitter.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let base = self.base_delay.as_millis() as u64;
        let delay = base.saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay).min(self.max_delay)
    }

    /// Decide what happens after a transient failure on attempt number `attempts`.
    pub fn next_delay(&self, attempts: u32, elapsed: Duration) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
        }

        let delay = self.jittered(self.backoff_delay(attempts));
        if elapsed.saturating_add(delay) > self.max_elapsed {
            return RetryDecision::GiveUp(GiveUpReason::BudgetExhausted);
        }

        RetryDecision::RetryAfter(delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let ms = delay.as_millis() as u64;
        if ms < 2 {
            return delay;
        }
        Duration::from_millis(rand::rng().random_range(ms / 2..=ms))
    }
}
