//! Adaptive chunk sizing from observed processing time.

use std::time::Duration;

/// Minimum relative change before a new size is applied.
const HYSTERESIS: f64 = 0.1;

/// Steers future chunk sizes towards a target processing time.
///
/// After each successful chunk the size is scaled by `target / actual` and
/// clamped to `[min, max]`. Changes of 10% or less are ignored so the size
/// does not oscillate around the target.
#[derive(Debug, Clone)]
pub struct AdaptiveSizer {
    current: usize,
    min: usize,
    max: usize,
    target: Duration,
    adjustments: u64,
}

impl AdaptiveSizer {
    pub fn new(initial: usize, min: usize, max: usize, target: Duration) -> Self {
        Self {
            current: initial.clamp(min, max),
            min,
            max,
            target,
            adjustments: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn adjustments(&self) -> u64 {
        self.adjustments
    }

    /// Size the controller would pick after a chunk took `elapsed`.
    pub fn proposed(&self, elapsed: Duration) -> usize {
        // Sub-millisecond chunks would otherwise blow the ratio up to infinity
        let actual = elapsed.as_secs_f64().max(0.001);
        let adjustment = self.target.as_secs_f64() / actual;
        let scaled = self.current as f64 * adjustment;
        let scaled = if scaled.is_finite() {
            scaled.min(self.max as f64)
        } else {
            self.max as f64
        };
        (scaled as usize).clamp(self.min, self.max)
    }

    /// Feed an observation. Returns the new size when it changed.
    pub fn observe(&mut self, elapsed: Duration) -> Option<usize> {
        let proposed = self.proposed(elapsed);
        let delta = proposed.abs_diff(self.current) as f64;
        if delta > HYSTERESIS * self.current as f64 {
            tracing::debug!(
                "Adaptive chunk size {} -> {} (chunk took {:?}, target {:?})",
                self.current,
                proposed,
                elapsed,
                self.target
            );
            self.current = proposed;
            self.adjustments += 1;
            Some(proposed)
        } else {
            None
        }
    }
}
