//! Exponential backoff for upstream reconnect attempts

use std::time::Duration;

use rand::Rng;

use crate::config::UpstreamConfig;

/// Jitter applied to every delay, as a fraction of the base value.
const JITTER_FACTOR: f64 = 0.1;

/// Capped exponential backoff with jitter.
///
/// The first delay is the configured initial value; each subsequent delay
/// doubles until the cap. Jitter keeps a fleet of overlay hosts from
/// reconnecting in lockstep after a backend restart.
#[derive(Debug)]
pub struct ReconnectBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    next_delay_ms: u64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            next_delay_ms: initial_delay_ms,
            attempt: 0,
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(
            config.reconnect_initial_delay_ms,
            config.reconnect_max_delay_ms,
        )
    }

    /// Get the next delay duration
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let base = self.next_delay_ms;
        self.next_delay_ms = (base.saturating_mul(2)).min(self.max_delay_ms);

        let jitter_range = base as f64 * JITTER_FACTOR;
        let delay_ms = if jitter_range > 0.0 {
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (base as f64 + jitter).max(1.0) as u64
        } else {
            base.max(1)
        };

        Duration::from_millis(delay_ms)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.next_delay_ms = self.initial_delay_ms;
        self.attempt = 0;
    }

    /// Get the current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
