//! Bounded retry with exponential backoff.
//!
//! Retry progress is plain data on the item (`RetryState`) rather than a
//! loop hidden in a call stack, so a crashed run resumes with the attempts
//! already spent.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::collaborators::{CollaboratorError, ErrorClass};
use crate::config::RetryConfig;
use crate::model::Phase;

/// Attempt bookkeeping for the phase currently being run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Phase the attempts were spent on. Reset when the phase changes.
    pub phase: Option<Phase>,
    /// Failed attempts so far in `phase`.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl RetryState {
    /// Attempts already spent on `phase` (zero if the state belongs to another phase).
    pub fn attempts_for(&self, phase: Phase) -> u32 {
        if self.phase == Some(phase) {
            self.attempts
        } else {
            0
        }
    }

    pub fn record_failure(&mut self, phase: Phase, err: &CollaboratorError) {
        if self.phase != Some(phase) {
            self.phase = Some(phase);
            self.attempts = 0;
        }
        self.attempts += 1;
        self.last_error = Some(err.to_string());
        self.last_attempt_at = Some(Utc::now());
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// What to do after a collaborator call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    /// Attempt budget spent on transient errors.
    Exhausted,
    /// Error class that retrying cannot fix.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Delay before attempt `attempts + 1`, where `attempts` failures have happened.
    ///
    /// base * 2^(attempts - 1), capped, plus jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if self.jitter.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        delay + Duration::from_millis(extra)
    }

    /// Decide after `attempts` failures, the last of which was `err`.
    ///
    /// A server-supplied Retry-After is used as given, even past `max_delay`.
    pub fn decide(&self, attempts: u32, err: &CollaboratorError) -> RetryDecision {
        match err.class {
            ErrorClass::Permanent => RetryDecision::GiveUp,
            _ if attempts >= self.max_attempts => RetryDecision::Exhausted,
            ErrorClass::RateLimited {
                retry_after_ms: Some(ms),
            } => RetryDecision::RetryAfter(Duration::from_millis(ms)),
            ErrorClass::RateLimited { retry_after_ms: None } | ErrorClass::Transient => {
                RetryDecision::RetryAfter(self.backoff(attempts))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
