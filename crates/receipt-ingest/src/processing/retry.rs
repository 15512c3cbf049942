//! Scheduler-level retry decisions

use std::time::Duration;

use crate::config::RetryConfig;
use crate::types::FailureKind;

/// What to do with a failed job
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Re-admit after `delay`
    Retry { delay: Duration },
    /// Stop; the job stays failed with `kind`
    GiveUp { kind: FailureKind },
}

/// Bounded attempts with exponential delay
///
/// Pure: no clocks, no state. `attempt` is the 1-based attempt number of the
/// job that just failed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, config: &RetryConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }

    /// Delay before attempt `attempt + 1`: `base * multiplier^(attempt - 1)`, capped
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether a job at `attempt` has used up its admissions
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Kind to record for a failure, promoting to `MaxRetriesExceeded` when
    /// no further admission would be allowed
    pub fn classify(&self, attempt: u32, kind: FailureKind) -> FailureKind {
        if kind.is_retry_eligible() && self.is_exhausted(attempt) {
            FailureKind::MaxRetriesExceeded
        } else {
            kind
        }
    }

    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if !kind.is_retry_eligible() || self.is_exhausted(attempt) {
            return RetryDecision::GiveUp {
                kind: self.classify(attempt, kind),
            };
        }
        RetryDecision::Retry {
            delay: self.delay_after(attempt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, &RetryConfig::default())
    }
}
