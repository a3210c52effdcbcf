//! Exponential backoff policy for reconnection attempts

use std::time::{Duration, Instant};
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First retry interval
    pub initial_interval: Duration,
    /// Growth factor applied after each attempt
    pub multiplier: f64,
    /// Upper bound on a single interval
    pub max_interval: Duration,
    /// Total time budget; once exceeded the policy gives up
    pub max_elapsed: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

/// Retry pacing policy. `next_back_off` returns the delay before the next
/// attempt, or `None` once the policy has given up. Implementations are
/// driven from a single reconnect loop and need no internal synchronization.
pub trait Backoff {
    fn next_back_off(&mut self) -> Option<Duration>;

    /// Restore the initial interval; called once per successful connection.
    fn reset(&mut self);
}

/// Exponential backoff with a per-interval cap and a total-time budget
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    started: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_interval,
            config,
            started: None,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl Backoff for ExponentialBackoff {
    fn next_back_off(&mut self) -> Option<Duration> {
        let started = *self.started.get_or_insert_with(Instant::now);
        if started.elapsed() >= self.config.max_elapsed {
            debug!("backoff budget exhausted, giving up");
            return None;
        }

        let interval = self.current;
        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * self.config.multiplier);
        self.current = grown.min(self.config.max_interval);

        Some(interval)
    }

    fn reset(&mut self) {
        debug!("resetting backoff");
        self.current = self.config.initial_interval;
        self.started = None;
    }
}
