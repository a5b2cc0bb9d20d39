//! Memory backpressure: sampling memory pressure and gating dispatch.
//!
//! Pressure is a `used / limit` ratio supplied by a [`MemoryProbe`]. The
//! monitor engages when pressure rises above the threshold and only releases
//! once it falls below `resume_ratio * threshold`, so dispatch does not flap
//! around the threshold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use sysinfo::System;

/// Source of memory pressure readings.
///
/// Allows tests and embedders to supply their own accounting while the
/// default implementation reads system memory.
pub trait MemoryProbe: Send + Sync {
    /// Current memory pressure as a ratio in `[0, 1]` (may exceed 1 when over the limit).
    fn pressure(&self) -> f64;

    /// Estimated bytes available to the run. 0 means unknown.
    fn available_bytes(&self) -> u64;
}

/// Memory probe backed by `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    limit_bytes: Option<u64>,
}

impl SystemMemoryProbe {
    /// Probe measuring used memory against total system memory.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            limit_bytes: None,
        }
    }

    /// Probe measuring used memory against an explicit limit.
    pub fn with_limit(limit_bytes: Option<u64>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            limit_bytes,
        }
    }

    fn read(&self) -> (u64, u64, u64) {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        (system.used_memory(), system.total_memory(), system.available_memory())
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn pressure(&self) -> f64 {
        let (used, total, _) = self.read();
        let limit = self.limit_bytes.unwrap_or(total);
        if limit == 0 {
            return 0.0;
        }
        used as f64 / limit as f64
    }

    fn available_bytes(&self) -> u64 {
        let (used, _, available) = self.read();
        match self.limit_bytes {
            Some(limit) => limit.saturating_sub(used).min(available),
            None => available,
        }
    }
}

/// Memory probe whose readings are set by the caller.
#[derive(Debug)]
pub struct ManualMemoryProbe {
    pressure_bits: AtomicU64,
    available: AtomicU64,
}

impl ManualMemoryProbe {
    pub fn new(pressure: f64, available_bytes: u64) -> Self {
        Self {
            pressure_bits: AtomicU64::new(pressure.to_bits()),
            available: AtomicU64::new(available_bytes),
        }
    }

    pub fn set_pressure(&self, pressure: f64) {
        self.pressure_bits.store(pressure.to_bits(), Ordering::SeqCst);
    }

    pub fn set_available_bytes(&self, bytes: u64) {
        self.available.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn pressure(&self) -> f64 {
        f64::from_bits(self.pressure_bits.load(Ordering::SeqCst))
    }

    fn available_bytes(&self) -> u64 {
        self.available.load(Ordering::SeqCst)
    }
}

/// Outcome of a pressure sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PressureTransition {
    /// No change in gating
    Steady,
    /// Pressure crossed the threshold; dispatch must stop
    Engaged(f64),
    /// Pressure fell below the resume level; dispatch may continue
    Released(f64),
}

/// Pause/resume state machine over pressure samples.
#[derive(Debug, Clone)]
pub struct BackpressureMonitor {
    threshold: f64,
    resume_ratio: f64,
    engaged: bool,
    events: u64,
    last_pressure: f64,
}

impl BackpressureMonitor {
    pub fn new(threshold: f64, resume_ratio: f64) -> Self {
        Self {
            threshold,
            resume_ratio,
            engaged: false,
            events: 0,
            last_pressure: 0.0,
        }
    }

    /// Pressure below which an engaged monitor releases.
    pub fn resume_level(&self) -> f64 {
        self.threshold * self.resume_ratio
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Number of times backpressure engaged.
    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn last_pressure(&self) -> f64 {
        self.last_pressure
    }

    pub fn sample(&mut self, pressure: f64) -> PressureTransition {
        self.last_pressure = pressure;
        if !self.engaged && pressure > self.threshold {
            self.engaged = true;
            self.events += 1;
            PressureTransition::Engaged(pressure)
        } else if self.engaged && pressure < self.resume_level() {
            self.engaged = false;
            PressureTransition::Released(pressure)
        } else {
            PressureTransition::Steady
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engage_and_release_with_hysteresis() {
        let mut monitor = BackpressureMonitor::new(0.7, 0.8);
        assert_eq!(monitor.sample(0.5), PressureTransition::Steady);
        assert_eq!(monitor.sample(0.9), PressureTransition::Engaged(0.9));
        assert!(monitor.is_engaged());

        // Below the threshold but above 0.56 keeps dispatch paused
        assert_eq!(monitor.sample(0.6), PressureTransition::Steady);
        assert_eq!(monitor.sample(0.56), PressureTransition::Steady);
        assert!(monitor.is_engaged());

        assert_eq!(monitor.sample(0.5), PressureTransition::Released(0.5));
        assert!(!monitor.is_engaged());
        assert_eq!(monitor.events(), 1);
    }

    #[test]
    fn test_repeated_high_samples_count_once() {
        let mut monitor = BackpressureMonitor::new(0.8, 0.8);
        monitor.sample(0.95);
        monitor.sample(0.97);
        monitor.sample(0.99);
        assert_eq!(monitor.events(), 1);
        assert!((monitor.last_pressure() - 0.99).abs() < f64::EPSILON);
    }

    #[test]
    fn test_manual_probe() {
        let probe = ManualMemoryProbe::new(0.25, 1024);
        assert_eq!(probe.pressure(), 0.25);
        assert_eq!(probe.available_bytes(), 1024);

        probe.set_pressure(0.9);
        probe.set_available_bytes(0);
        assert_eq!(probe.pressure(), 0.9);
        assert_eq!(probe.available_bytes(), 0);
    }

    #[test]
    fn test_system_probe_reports_sane_values() {
        let probe = SystemMemoryProbe::new();
        let pressure = probe.pressure();
        assert!(pressure >= 0.0);
        assert!(pressure.is_finite());
    }
}
