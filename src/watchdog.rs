//! Memory pressure watchdog.
//!
//! One sampler thread watches resident/total/free memory and emits level
//! transitions on threshold crossings: `normal → warn → pause → reject →
//! emergency`. `pause` pauses background sweeps, `reject` refuses new
//! sandbox spawns, `emergency` additionally cancels non-critical work.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::types::MemoryConfig;

/// Memory pressure levels, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressureLevel {
    Normal,
    Warn,
    Pause,
    Reject,
    Emergency,
}

impl MemoryPressureLevel {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => MemoryPressureLevel::Warn,
            2 => MemoryPressureLevel::Pause,
            3 => MemoryPressureLevel::Reject,
            4 => MemoryPressureLevel::Emergency,
            _ => MemoryPressureLevel::Normal,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            MemoryPressureLevel::Normal => 0,
            MemoryPressureLevel::Warn => 1,
            MemoryPressureLevel::Pause => 2,
            MemoryPressureLevel::Reject => 3,
            MemoryPressureLevel::Emergency => 4,
        }
    }

    /// New sandbox spawns are refused at this level.
    pub fn refuses_spawns(self) -> bool {
        self >= MemoryPressureLevel::Reject
    }

    /// Background sweeps pause at this level.
    pub fn pauses_background(self) -> bool {
        self >= MemoryPressureLevel::Pause
    }
}

/// One memory reading, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub total: u64,
    pub free: u64,
}

/// Sampler seam so tests can drive synthetic pressure.
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Linux sampler over `/proc/meminfo`; other platforms read as unloaded.
#[derive(Debug, Default)]
pub struct ProcMeminfoSampler;

impl MemorySampler for ProcMeminfoSampler {
    fn sample(&self) -> MemorySample {
        let text = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
        let field = |name: &str| -> u64 {
            text.lines()
                .find(|l| l.starts_with(name))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok())
                .map(|kib| kib * 1024)
                .unwrap_or(0)
        };
        let total = field("MemTotal:");
        let free = field("MemAvailable:");
        if total == 0 {
            // No meminfo: report fully unloaded so thresholds never fire.
            return MemorySample {
                total: u64::MAX,
                free: u64::MAX,
            };
        }
        MemorySample { total, free }
    }
}

/// The watchdog. `current()` is lock-free for hot-path gating; level
/// transitions broadcast to subscribers.
pub struct MemoryWatchdog {
    config: MemoryConfig,
    sampler: Arc<dyn MemorySampler>,
    level: AtomicU8,
    sender: broadcast::Sender<MemoryPressureLevel>,
}

impl std::fmt::Debug for MemoryWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWatchdog")
            .field("level", &self.current())
            .finish_non_exhaustive()
    }
}

impl MemoryWatchdog {
    pub fn new(config: MemoryConfig, sampler: Arc<dyn MemorySampler>) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            config,
            sampler,
            level: AtomicU8::new(0),
            sender,
        }
    }

    pub fn current(&self) -> MemoryPressureLevel {
        MemoryPressureLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryPressureLevel> {
        self.sender.subscribe()
    }

    /// Take one sample and publish any level transition.
    pub fn tick(&self) -> MemoryPressureLevel {
        let sample = self.sampler.sample();
        let next = self.classify(sample);
        let previous = MemoryPressureLevel::from_u8(
            self.level.swap(next.as_u8(), Ordering::Relaxed),
        );
        if next != previous {
            if next > previous {
                warn!(from = ?previous, to = ?next, "memory pressure rising");
            } else {
                info!(from = ?previous, to = ?next, "memory pressure easing");
            }
            let _ = self.sender.send(next);
        }
        next
    }

    /// Sampling loop; exits on cancellation.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }

    fn classify(&self, sample: MemorySample) -> MemoryPressureLevel {
        if sample.total == 0 {
            return MemoryPressureLevel::Normal;
        }
        let emergency_floor = self.config.emergency_free_mb.saturating_mul(1024 * 1024);
        if sample.free < emergency_floor {
            return MemoryPressureLevel::Emergency;
        }
        let used = (sample.total - sample.free.min(sample.total)) as u128;
        let used_pct = (used * 100 / sample.total as u128) as u8;
        if used_pct >= self.config.reject_pct {
            MemoryPressureLevel::Reject
        } else if used_pct >= self.config.pause_pct {
            MemoryPressureLevel::Pause
        } else if used_pct >= self.config.warn_pct {
            MemoryPressureLevel::Warn
        } else {
            MemoryPressureLevel::Normal
        }
    }
}
