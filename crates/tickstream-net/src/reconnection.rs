//! Client-side reconnection with exponential backoff.
//!
//! A dropped stream is retried after `initial × 2^failures` (capped), and the
//! failure count starts over whenever a connection succeeds, so a client that
//! keeps making progress never runs out of retries.

use std::time::Duration;

use rand::Rng;

/// Retry policy for a client whose stream dropped before `EOF`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first retry. Default: 1 s.
    pub initial_delay: Duration,
    /// Growth factor per consecutive failure. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Upper bound on any single wait. Default: 60 s.
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up. Default: 10.
    pub max_retries: u32,
    /// Relative spread (0.0 to 1.0) applied as ±jitter. Default: none.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 10,
            jitter: 0.0,
        }
    }
}

/// Consecutive-failure counter; the k-th retry waits
/// `initial_delay × multiplier^k`, capped at `max_delay`.
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Wait before the next retry, or `None` once `max_retries` consecutive
    /// retries have been spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_retries {
            return None;
        }
        let base = self.backoff_for(self.attempts);
        self.attempts += 1;
        Some(self.jittered(base).min(self.config.max_delay))
    }

    /// Forget past failures. Called once a connection is established.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Retries used since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Retries left before giving up.
    pub fn remaining(&self) -> u32 {
        self.config.max_retries.saturating_sub(self.attempts)
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs =
            self.config.initial_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            self.config.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.config.jitter <= 0.0 {
            return base;
        }
        let spread = self.config.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        base.mul_f64(factor)
    }
}
