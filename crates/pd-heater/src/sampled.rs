//! Fixed-period tick scheduling for the background control loop.
//!
//! Times are seconds since the loop started. Ticks never overlap: when a tick
//! overruns one or more boundaries, the missed boundaries are skipped rather
//! than executed back-to-back.

use serde::{Deserialize, Serialize};

/// Tick configuration for the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickConfig {
    /// Tick period in seconds.
    pub period_s: f64,
}

impl TickConfig {
    /// Create a new tick configuration.
    ///
    /// # Panics
    ///
    /// Panics if `period_s` is not positive. Board configuration validation
    /// rejects such periods before a loop is built.
    pub fn new(period_s: f64) -> Self {
        assert!(period_s > 0.0, "Tick period must be positive");
        Self { period_s }
    }
}

/// Tracks when the next control tick is due.
#[derive(Debug, Clone, PartialEq)]
pub struct TickClock {
    /// Tick configuration.
    pub config: TickConfig,
    /// Time of next scheduled tick.
    pub next_tick_s: f64,
}

impl TickClock {
    /// Create a clock whose first tick is due at `start_s`.
    pub fn new(config: TickConfig, start_s: f64) -> Self {
        Self {
            config,
            next_tick_s: start_s,
        }
    }

    /// Check if a tick is due at the given time.
    pub fn is_due(&self, now_s: f64) -> bool {
        now_s >= self.next_tick_s
    }

    /// Schedule the tick after the one being executed at `now_s`.
    ///
    /// Returns the number of boundaries skipped because `now_s` was already
    /// past them.
    pub fn advance(&mut self, now_s: f64) -> u64 {
        self.next_tick_s += self.config.period_s;
        if now_s < self.next_tick_s {
            return 0;
        }
        let behind = ((now_s - self.next_tick_s) / self.config.period_s).floor() + 1.0;
        self.next_tick_s += behind * self.config.period_s;
        behind as u64
    }

    /// Get the time until the next tick.
    pub fn time_until_tick(&self, now_s: f64) -> f64 {
        (self.next_tick_s - now_s).max(0.0)
    }
}
