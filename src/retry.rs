//! Retry and failure policy.
//!
//! When a job body fails, the worker asks the job's [`RetryPolicy`] what to
//! do next. The answer depends only on the job's attempt count and on whether
//! the error is retryable, so the same inputs always produce the same
//! decision.
//!
//! # Examples
//!
//! ```rust
//! use backlot::retry::{BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! // 1s, 2s, 4s, 8s ... capped at five minutes, dead after the fifth failure
//! let policy = RetryPolicy::new(5)
//!     .with_backoff(BackoffStrategy::exponential(Duration::from_secs(1), 2.0))
//!     .with_max_delay(Duration::from_secs(5 * 60));
//!
//! assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
//! ```

use crate::config::{duration_str, option_duration_str};
use crate::handler::JobError;
use crate::job::Job;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delays never drop below this, so a retried job is always rescheduled.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// How the delay between attempts grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed {
        #[serde(with = "duration_str")]
        delay: Duration,
    },

    /// `base + increment * attempts`
    Linear {
        #[serde(with = "duration_str")]
        base: Duration,
        #[serde(with = "duration_str")]
        increment: Duration,
    },

    /// `base * multiplier ^ attempts`
    Exponential {
        #[serde(with = "duration_str")]
        base: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffStrategy::Fixed { delay }
    }

    pub fn linear(base: Duration, increment: Duration) -> Self {
        BackoffStrategy::Linear { base, increment }
    }

    pub fn exponential(base: Duration, multiplier: f64) -> Self {
        BackoffStrategy::Exponential { base, multiplier }
    }

    /// Uncapped delay after `attempts` previous failures.
    pub fn calculate_delay(&self, attempts: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, increment } => {
                base.saturating_add(increment.saturating_mul(attempts))
            }
            BackoffStrategy::Exponential { base, multiplier } => {
                let factor = multiplier.powi(attempts.min(i32::MAX as u32) as i32);
                let secs = base.as_secs_f64() * factor;
                if secs.is_finite() && secs >= 0.0 {
                    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
                } else {
                    Duration::MAX
                }
            }
        }
    }

    pub fn base_delay(&self) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, .. } | BackoffStrategy::Exponential { base, .. } => {
                *base
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::exponential(Duration::from_secs(1), 2.0)
    }
}

/// What happens to a job after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule after the given delay.
    Retry(Duration),
    /// Retries exhausted; park the job for operator attention.
    Dead,
    /// The error is permanent; do not retry.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total executions allowed, including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    #[serde(
        with = "option_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: BackoffStrategy::default(),
            max_delay: Some(Duration::from_secs(60 * 60)),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn without_max_delay(mut self) -> Self {
        self.max_delay = None;
        self
    }

    /// Delay before the next execution of a job that has failed `attempts`
    /// times before this failure.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let delay = self.backoff.calculate_delay(attempts);
        let capped = match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        };
        capped.max(MIN_RETRY_DELAY)
    }

    /// Decides the fate of `job` after it failed with `error`. `job.attempts`
    /// is the count before this failure is recorded.
    pub fn decide(&self, job: &Job, error: &JobError) -> RetryDecision {
        self.decide_for_attempts(job.attempts, error)
    }

    pub fn decide_for_attempts(&self, attempts: u32, error: &JobError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Fail;
        }
        if attempts.saturating_add(1) >= self.max_attempts {
            return RetryDecision::Dead;
        }
        RetryDecision::Retry(self.delay_for_attempt(attempts))
    }
}
