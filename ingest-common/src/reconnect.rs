//! # Reconnect
//!
//! Module providing a `BackoffPolicy` to space out reconnection attempts, and the
//! `ReconnectionManager` that decides whether another attempt is allowed at all.
use std::time;

use rand::Rng;

/// Largest fraction of a delay that jitter may shave off.
const JITTER_RATIO: f64 = 0.2;

#[derive(Clone, Debug)]
/// Exponential backoff parameters for reconnecting to the relay.
pub struct BackoffPolicy {
    /// Coefficient to multiply initial_interval with for every past failure.
    pub backoff_coefficient: u32,
    /// The backoff interval after the first failure.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    pub maximum_interval: Option<time::Duration>,
    /// Randomly shorten each delay so that many consumers do not reconnect in lockstep.
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Initialize a `BackoffPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> BackoffPolicyBuilder {
        BackoffPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the delay before reconnecting after `failures` consecutive failures.
    /// Saturates at `maximum_interval` instead of overflowing.
    pub fn backoff_interval(&self, failures: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(failures.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        let interval = match (candidate_interval, self.maximum_interval) {
            (Some(candidate), Some(max_interval)) => std::cmp::min(candidate, max_interval),
            (Some(candidate), None) => candidate,
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        };

        if self.jitter {
            let shave = rand::thread_rng().gen_range(0.0..JITTER_RATIO);
            interval.mul_f64(1.0 - shave)
        } else {
            interval
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `BackoffPolicy`.
pub struct BackoffPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub jitter: bool,
}

impl Default for BackoffPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: Some(time::Duration::from_secs(60)),
            jitter: false,
        }
    }
}

impl BackoffPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..BackoffPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> BackoffPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn jitter(mut self, jitter: bool) -> BackoffPolicyBuilder {
        self.jitter = jitter;
        self
    }

    /// Provide a `BackoffPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> BackoffPolicy {
        BackoffPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            jitter: self.jitter,
        }
    }
}

/// Tracks consecutive transport failures. Decides only; the caller does the waiting.
///
/// State lives in memory and starts from zero on every process start. A single successful
/// connection clears the failure count.
#[derive(Debug)]
pub struct ReconnectionManager {
    max_attempts: u32,
    policy: BackoffPolicy,
    consecutive_failures: u32,
    last_attempt: Option<time::Instant>,
}

impl ReconnectionManager {
    pub fn new(max_attempts: u32, policy: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            policy,
            consecutive_failures: 0,
            last_attempt: None,
        }
    }

    pub fn should_retry(&self) -> bool {
        self.consecutive_failures < self.max_attempts
    }

    pub fn record_attempt(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_attempt = Some(time::Instant::now());
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Delay to wait before the next connection attempt.
    pub fn next_backoff(&self) -> time::Duration {
        self.policy.backoff_interval(self.consecutive_failures)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn last_attempt(&self) -> Option<time::Instant> {
        self.last_attempt
    }
}
