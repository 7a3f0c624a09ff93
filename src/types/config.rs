//! Runtime configuration.
//!
//! One immutable config struct with defaulted fields. `from_json` rejects
//! unknown keys at load time; `validate` checks ranges once so components
//! can store derived constants without re-checking.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Error, Result};

/// Global runtime configuration. Field names follow the external
/// camelCase option names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Worker pool size.
    pub workers: usize,

    /// Enqueue-to-terminal cap per job; also bounds the approval wait.
    pub job_timeout_ms: u64,

    /// Deadline for one `validate.request` dispatch.
    pub validation_timeout_ms: u64,

    /// Deadline for one `plan.request` dispatch.
    pub plan_timeout_ms: u64,

    /// Deadline for one step execution inside the DAG.
    pub step_timeout_ms: u64,

    /// Bound on validator-driven replan cycles.
    pub max_revision_count: u32,

    /// Bound on fast-path reroute replans.
    pub max_replan_count: u32,

    /// Retry cap for step-scoped (sandbox) attempts and lease recovery.
    pub max_step_attempts: u32,

    /// Idempotency-key dedup window on enqueue.
    pub dedup_window_ms: u64,

    /// Replay guard acceptance window for envelope timestamps.
    pub replay_window_ms: u64,

    /// Router refuses payloads above this size.
    pub max_message_size_bytes: usize,

    /// Router warns (but delivers) above this size.
    pub message_warning_threshold_bytes: usize,

    /// Per-gear circuit breaker policy.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Drain window on worker pool stop before hard cancellation.
    pub graceful_shutdown_timeout_ms: u64,

    /// SIGTERM-to-SIGKILL grace for sandbox children.
    pub gear_kill_timeout_ms: u64,

    /// Memory watchdog thresholds.
    pub memory: MemoryConfig,

    /// Parallelism cap inside one DAG execution.
    pub max_concurrency: usize,

    /// Job lease duration; heartbeats fire every third of this.
    pub lease_ms: u64,

    /// Calls per action category before a standing rule is suggested.
    pub standing_rule_suggestion_count: u32,

    /// Validity window for approval nonces.
    pub approval_nonce_ttl_hours: u32,
}

/// Circuit breaker policy for sandbox executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the breaker.
    pub failures: u32,

    /// Rolling window length.
    pub window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failures: 5,
            window_ms: 60_000,
        }
    }
}

/// Memory watchdog thresholds. Percentages are of total memory used;
/// the emergency floor is absolute free memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct MemoryConfig {
    pub warn_pct: u8,
    pub pause_pct: u8,
    pub reject_pct: u8,
    pub emergency_free_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warn_pct: 70,
            pause_pct: 80,
            reject_pct: 90,
            emergency_free_mb: 256,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            job_timeout_ms: 600_000,
            validation_timeout_ms: 30_000,
            plan_timeout_ms: 60_000,
            step_timeout_ms: 300_000,
            max_revision_count: 3,
            max_replan_count: 3,
            max_step_attempts: 3,
            dedup_window_ms: 60_000,
            replay_window_ms: 60_000,
            max_message_size_bytes: 1_048_576,
            message_warning_threshold_bytes: 262_144,
            circuit_breaker: CircuitBreakerConfig::default(),
            graceful_shutdown_timeout_ms: 30_000,
            gear_kill_timeout_ms: 5_000,
            memory: MemoryConfig::default(),
            max_concurrency: 4,
            lease_ms: 30_000,
            standing_rule_suggestion_count: 5,
            approval_nonce_ttl_hours: 24,
        }
    }
}

impl RuntimeConfig {
    /// Parse from JSON, rejecting unknown keys.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::validation(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks, run once at construction.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::validation("workers must be >= 1"));
        }
        if self.max_concurrency == 0 {
            return Err(Error::validation("maxConcurrency must be >= 1"));
        }
        if self.max_step_attempts == 0 {
            return Err(Error::validation("maxStepAttempts must be >= 1"));
        }
        if self.circuit_breaker.failures == 0 {
            return Err(Error::validation("circuitBreaker.failures must be >= 1"));
        }
        if self.lease_ms == 0 {
            return Err(Error::validation("leaseMs must be > 0"));
        }
        if self.message_warning_threshold_bytes > self.max_message_size_bytes {
            return Err(Error::validation(
                "messageWarningThresholdBytes must not exceed maxMessageSizeBytes",
            ));
        }
        let m = &self.memory;
        if !(m.warn_pct < m.pause_pct && m.pause_pct < m.reject_pct && m.reject_pct < 100) {
            return Err(Error::validation(
                "memory thresholds must satisfy warnPct < pausePct < rejectPct < 100",
            ));
        }
        Ok(())
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Heartbeats fire every `leaseMs / 3`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.lease_ms / 3)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn plan_timeout(&self) -> Duration {
        Duration::from_millis(self.plan_timeout_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub fn gear_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.gear_kill_timeout_ms)
    }
}
