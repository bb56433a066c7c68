//! Resource pressure classification.
//!
//! The monitor is polled by producers, never pushed to. Classification is a
//! pure function of the current memory usage ratio (consumed / capacity):
//!
//! | Level | Usage | Policy |
//! |-------|-------|--------|
//! | `Normal` | `< light` (0.60) | no delay |
//! | `Light` | `light..heavy` (0.60–0.75) | short delay |
//! | `Heavy` | `heavy..emergency` (0.75–0.85) | longer delay |
//! | `Emergency` | `>= emergency` (0.85) | longest delay + reclaim hint |
//!
//! There is no hysteresis: a ratio hovering on a boundary may alternate
//! between two adjacent levels from one sample to the next.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::config::{PressureThresholds, ThrottleDelays};

/// Ordered throttle levels. `Normal < Light < Heavy < Emergency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevel {
    Normal,
    Light,
    Heavy,
    Emergency,
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThrottleLevel::Normal => "normal",
            ThrottleLevel::Light => "light",
            ThrottleLevel::Heavy => "heavy",
            ThrottleLevel::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

impl PressureThresholds {
    /// Classify a usage ratio. NaN and negative ratios count as zero pressure.
    pub fn classify(&self, ratio: f64) -> ThrottleLevel {
        let ratio = if ratio.is_nan() { 0.0 } else { ratio };
        if ratio >= self.emergency {
            ThrottleLevel::Emergency
        } else if ratio >= self.heavy {
            ThrottleLevel::Heavy
        } else if ratio >= self.light {
            ThrottleLevel::Light
        } else {
            ThrottleLevel::Normal
        }
    }
}

impl ThrottleDelays {
    pub fn delay_for(&self, level: ThrottleLevel) -> Duration {
        let ms = match level {
            ThrottleLevel::Normal => self.normal_ms,
            ThrottleLevel::Light => self.light_ms,
            ThrottleLevel::Heavy => self.heavy_ms,
            ThrottleLevel::Emergency => self.emergency_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Source of the current memory usage ratio.
pub trait MemoryProbe: Send + Sync {
    /// Current usage as consumed / capacity. Implementations return `0.0`
    /// when usage cannot be determined.
    fn usage_ratio(&self) -> f64;
}

/// Measures this process's resident memory with `sysinfo` and divides it by
/// a fixed capacity. A capacity of zero disables measurement.
pub struct ProcessMemoryProbe {
    capacity_bytes: u64,
    pid: Pid,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new(capacity_mb: u64) -> Self {
        Self {
            capacity_bytes: capacity_mb.saturating_mul(1024 * 1024),
            pid: Pid::from_u32(std::process::id()),
            system: Mutex::new(System::new()),
        }
    }

    /// Resident bytes of this process after refreshing only its memory
    /// counters.
    fn resident_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(self.pid).map(|p| p.memory())
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn usage_ratio(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        match self.resident_bytes() {
            Some(rss) => rss as f64 / self.capacity_bytes as f64,
            None => 0.0,
        }
    }
}

/// Probe returning a settable ratio. Used by tests and by embedders that
/// measure memory themselves.
#[derive(Default)]
pub struct FixedProbe {
    bits: AtomicU64,
}

impl FixedProbe {
    pub fn new(ratio: f64) -> Self {
        Self {
            bits: AtomicU64::new(ratio.to_bits()),
        }
    }

    pub fn set(&self, ratio: f64) {
        self.bits.store(ratio.to_bits(), Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedProbe {
    fn usage_ratio(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Hook invoked when the monitor asks the process to release memory.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// One observation of the monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureSample {
    pub ratio: f64,
    pub level: ThrottleLevel,
    pub delay: Duration,
}

/// Shared, read-only pressure monitor.
///
/// Holds no mutable throttling state of its own; counters of applied delays
/// live with the caller.
pub struct PressureMonitor {
    probe: Arc<dyn MemoryProbe>,
    thresholds: PressureThresholds,
    delays: ThrottleDelays,
    reclaim: Option<ReclaimHook>,
}

impl PressureMonitor {
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        thresholds: PressureThresholds,
        delays: ThrottleDelays,
    ) -> Self {
        Self {
            probe,
            thresholds,
            delays,
            reclaim: None,
        }
    }

    /// Install a hook called on every emergency-level sample.
    pub fn with_reclaim_hook(mut self, hook: ReclaimHook) -> Self {
        self.reclaim = Some(hook);
        self
    }

    pub fn level(&self, ratio: f64) -> ThrottleLevel {
        self.thresholds.classify(ratio)
    }

    /// Poll the probe and classify the result.
    pub fn sample(&self) -> PressureSample {
        let ratio = self.probe.usage_ratio();
        let level = self.thresholds.classify(ratio);
        PressureSample {
            ratio,
            level,
            delay: self.delays.delay_for(level),
        }
    }

    /// Ask the process to give memory back. Called by producers when a sample
    /// comes back at [`ThrottleLevel::Emergency`].
    pub fn request_reclaim(&self, ratio: f64) {
        tracing::warn!(ratio, "memory pressure at emergency level, requesting reclaim");
        if let Some(hook) = &self.reclaim {
            hook();
        }
    }
}
