use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Coarse-grained memory pressure levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl MemoryPressure {
    /// Compile workers stop parsing and report low memory at this level or above.
    pub fn is_low_memory(self) -> bool {
        self >= MemoryPressure::High
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MemoryPressure::Low,
            1 => MemoryPressure::Medium,
            2 => MemoryPressure::High,
            _ => MemoryPressure::Critical,
        }
    }
}

/// Thresholds for computing [`MemoryPressure`] from memory usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPressureThresholds {
    /// Enter `Medium` when `used / total >= medium`.
    pub medium: f64,
    /// Enter `High` when `used / total >= high`.
    pub high: f64,
    /// Enter `Critical` when `used / total >= critical`.
    pub critical: f64,
}

impl Default for MemoryPressureThresholds {
    fn default() -> Self {
        Self {
            medium: 0.70,
            high: 0.85,
            critical: 0.95,
        }
    }
}

impl MemoryPressureThresholds {
    pub fn level_for_ratio(self, ratio: f64) -> MemoryPressure {
        if ratio >= self.critical {
            MemoryPressure::Critical
        } else if ratio >= self.high {
            MemoryPressure::High
        } else if ratio >= self.medium {
            MemoryPressure::Medium
        } else {
            MemoryPressure::Low
        }
    }
}

/// Source of memory pressure readings for compile workers.
pub trait MemoryStatus: Send + Sync {
    fn pressure(&self) -> MemoryPressure;

    /// Called after a worker gave up because of low memory, before it is retried.
    fn free_memory(&self) {}
}

/// Reads memory usage through `sysinfo`.
///
/// With a budget, pressure is the process's resident size relative to the budget.
/// Without one it is the machine's used memory relative to its total.
pub struct SystemMemoryStatus {
    system: Mutex<System>,
    budget_bytes: Option<u64>,
    thresholds: MemoryPressureThresholds,
}

impl SystemMemoryStatus {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            budget_bytes: None,
            thresholds: MemoryPressureThresholds::default(),
        }
    }

    pub fn with_budget(budget_bytes: u64) -> Self {
        Self {
            budget_bytes: Some(budget_bytes.max(1)),
            ..Self::new()
        }
    }

    pub fn with_thresholds(mut self, thresholds: MemoryPressureThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    fn usage_ratio(&self) -> Option<f64> {
        let mut system = self.system.lock();
        match self.budget_bytes {
            Some(budget) => {
                let pid = match sysinfo::get_current_pid() {
                    Ok(pid) => pid,
                    Err(err) => {
                        tracing::debug!(target = "strata.index", error = err, "no current pid");
                        return None;
                    }
                };
                system.refresh_process(pid);
                let rss = system.process(pid)?.memory();
                Some(rss as f64 / budget as f64)
            }
            None => {
                system.refresh_memory();
                let total = system.total_memory();
                if total == 0 {
                    return None;
                }
                Some(system.used_memory() as f64 / total as f64)
            }
        }
    }
}

impl Default for SystemMemoryStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStatus for SystemMemoryStatus {
    fn pressure(&self) -> MemoryPressure {
        match self.usage_ratio() {
            Some(ratio) => self.thresholds.level_for_ratio(ratio),
            None => MemoryPressure::Low,
        }
    }
}

/// A settable reading, for embedders that track memory themselves.
#[derive(Debug)]
pub struct FixedMemoryStatus {
    level: AtomicU8,
}

impl FixedMemoryStatus {
    pub fn new(level: MemoryPressure) -> Self {
        Self {
            level: AtomicU8::new(level as u8),
        }
    }

    pub fn set(&self, level: MemoryPressure) {
        self.level.store(level as u8, Ordering::SeqCst);
    }
}

impl Default for FixedMemoryStatus {
    fn default() -> Self {
        Self::new(MemoryPressure::Low)
    }
}

impl MemoryStatus for FixedMemoryStatus {
    fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_u8(self.level.load(Ordering::SeqCst))
    }
}
