//! Speed stabilization detection
//!
//! Lets a throughput phase end before its wall-clock budget once the
//! measured speed has stopped moving. This is a plain hysteresis filter,
//! not a statistical changepoint detector: it trades detection rigor for
//! low latency and predictability, and both knobs (relative threshold and
//! minimum stable duration) are configuration.

use std::time::{Duration, Instant};

/// Hysteresis filter over a rolling throughput signal.
///
/// Feed it the current speed on every progress tick; it reports `true`
/// once the relative change has stayed below `threshold` for at least
/// `min_stable`. Any larger swing re-arms the filter from scratch.
#[derive(Debug, Clone)]
pub struct StabilityDetector {
    /// Relative-change threshold (fractional, e.g. 0.05)
    threshold: f64,
    /// How long the signal must hold inside the threshold
    min_stable: Duration,
    /// Reference speed the next observation is compared against
    last_speed: f64,
    /// When the signal entered the stable band, if it is in one
    stable_since: Option<Instant>,
}

impl StabilityDetector {
    /// Create a new detector
    pub fn new(threshold: f64, min_stable: Duration) -> Self {
        Self {
            threshold,
            min_stable,
            last_speed: 0.0,
            stable_since: None,
        }
    }

    /// Observe the current speed at time `now`.
    ///
    /// Returns `true` when the phase should end early. `now` is injected
    /// rather than read internally so tests can drive synthetic timelines.
    pub fn observe(&mut self, current_speed: f64, now: Instant) -> bool {
        if self.last_speed == 0.0 {
            // Not enough data to compare against yet
            self.last_speed = current_speed;
            self.stable_since = None;
            return false;
        }

        let relative_change = (current_speed - self.last_speed).abs() / self.last_speed;
        if relative_change < self.threshold {
            match self.stable_since {
                None => {
                    self.stable_since = Some(now);
                    false
                }
                Some(since) => now.duration_since(since) > self.min_stable,
            }
        } else {
            self.last_speed = current_speed;
            self.stable_since = None;
            false
        }
    }

    /// Reset to the initial state (used at phase start)
    pub fn reset(&mut self) {
        self.last_speed = 0.0;
        self.stable_since = None;
    }
}
