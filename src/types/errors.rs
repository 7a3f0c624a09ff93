//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant carries a stable code (for wire payloads and job records) and a
//! retriability classification that drives retry/backoff decisions.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Exponential backoff base for retriable errors.
const BACKOFF_BASE_MS: u64 = 1_000;
/// Backoff is capped here regardless of attempt count.
const BACKOFF_CAP_MS: u64 = 30_000;

/// Main error enum for the orchestration core.
#[derive(Error, Debug)]
pub enum Error {
    /// Schema, manifest, or plan validation failures. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Signature, key, or principal failures.
    #[error("auth error: {0}")]
    Auth(String),

    /// Vault ACL denials. The message names the secret, never its value.
    #[error("secret access denied: {0}")]
    SecretAccess(String),

    /// Resource not found. The queue treats NotFound on lease as "race lost".
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent-modification conflicts (CAS losses, duplicate registration).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid state transition in the job state machine.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Plan, validation, step, or child-process deadline expiry.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Provider rate limiting (retriable).
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Quota or resource exhaustion (retriable).
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Upstream provider failure with an HTTP-style status. 5xx retries,
    /// 4xx terminates immediately.
    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    /// Token/cost budget exhausted; the job fails user-visibly.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// DAG preflight: dependency cycle. Fatal, no steps execute.
    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    /// DAG preflight: `dependsOn` names a step not in the plan.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// DAG preflight: a step depends on itself.
    #[error("self-dependency: {0}")]
    SelfDependency(String),

    /// Gear not installed or disabled.
    #[error("gear not found: {0}")]
    GearNotFound(String),

    /// Gear integrity or spawn failure.
    #[error("gear execution failed: {0}")]
    GearExecutionFailed(String),

    /// Gear exceeded its execution deadline.
    #[error("gear timeout: {0}")]
    GearTimeout(String),

    /// Gear does not implement the requested action.
    #[error("gear invalid: {0}")]
    GearInvalid(String),

    /// Gear-reported failure from inside the sandbox.
    #[error("gear error: {0}")]
    GearError(String),

    /// Cooperative cancellation observed.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Cryptographic failures (signing, AEAD, KDF).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Persistence failures.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors (bugs, poisoned locks, recovered panics).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error code for wire payloads and persisted job records.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Auth(_) => "AUTH_ERROR",
            Error::SecretAccess(_) => "SECRET_ACCESS_DENIED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::StateTransition(_) => "INVALID_TRANSITION",
            Error::Timeout(_) => "TIMEOUT",
            Error::RateLimit(_) => "RATE_LIMITED",
            Error::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Error::Provider { .. } => "PROVIDER_ERROR",
            Error::BudgetExceeded(_) => "BUDGET_EXCEEDED",
            Error::CycleDetected(_) => "CYCLE_DETECTED",
            Error::UnknownStep(_) => "UNKNOWN_STEP",
            Error::SelfDependency(_) => "SELF_DEPENDENCY",
            Error::GearNotFound(_) => "GEAR_NOT_FOUND",
            Error::GearExecutionFailed(_) => "GEAR_EXECUTION_FAILED",
            Error::GearTimeout(_) => "GEAR_TIMEOUT",
            Error::GearInvalid(_) => "GEAR_INVALID",
            Error::GearError(_) => "GEAR_ERROR",
            Error::Cancelled(_) => "CANCELLED",
            Error::Crypto(_) => "CRYPTO_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the failure may succeed on retry at the smallest idempotent
    /// unit (step attempt, chunk stream, lease recovery).
    pub fn retriable(&self) -> bool {
        match self {
            Error::RateLimit(_) | Error::QuotaExceeded(_) | Error::Timeout(_) => true,
            Error::Provider { status, .. } => {
                // 5xx retries; 4xx (client, quota, credentials) terminates.
                *status >= 500
            }
            Error::GearTimeout(_) => true,
            Error::Database(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Backoff delay before the given retry attempt (0-based):
    /// `min(BASE * 2^attempt + jitter(0..1000ms), 30s)`.
    pub fn backoff_delay(attempt: u32) -> Duration {
        let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..1_000);
        Duration::from_millis(exp.saturating_add(jitter).min(BACKOFF_CAP_MS))
    }

    /// Convert into the user-visible shape persisted on failed jobs.
    pub fn to_user_facing(&self) -> UserFacingError {
        UserFacingError {
            code: self.code().to_string(),
            message: self.to_string(),
            retriable: self.retriable(),
            cause: None,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn secret_access(msg: impl Into<String>) -> Self {
        Self::SecretAccess(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn budget_exceeded(msg: impl Into<String>) -> Self {
        Self::BudgetExceeded(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// User-visible failure attached to terminal job records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFacingError {
    pub code: String,
    pub message: String,
    pub retriable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl UserFacingError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retriable: false,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(Error::GearTimeout("x".into()).code(), "GEAR_TIMEOUT");
        assert_eq!(
            Error::GearExecutionFailed("x".into()).code(),
            "GEAR_EXECUTION_FAILED"
        );
        assert_eq!(Error::CycleDetected("a, b".into()).code(), "CYCLE_DETECTED");
    }

    #[test]
    fn test_retriability_classification() {
        assert!(Error::RateLimit("slow down".into()).retriable());
        assert!(Error::QuotaExceeded("tokens".into()).retriable());
        assert!(Error::timeout("step").retriable());
        assert!(Error::Provider {
            status: 503,
            message: "unavailable".into()
        }
        .retriable());

        // 4xx client errors terminate immediately.
        assert!(!Error::Provider {
            status: 401,
            message: "bad key".into()
        }
        .retriable());
        assert!(!Error::Provider {
            status: 402,
            message: "quota".into()
        }
        .retriable());
        assert!(!Error::validation("bad plan").retriable());
        assert!(!Error::BudgetExceeded("tokens".into()).retriable());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let d0 = Error::backoff_delay(0);
        assert!(d0 >= Duration::from_millis(1_000));
        assert!(d0 < Duration::from_millis(2_000));

        let d3 = Error::backoff_delay(3);
        assert!(d3 >= Duration::from_millis(8_000));
        assert!(d3 < Duration::from_millis(9_000));

        // Large attempts clamp at 30s.
        assert_eq!(Error::backoff_delay(30), Duration::from_millis(30_000));
    }

    #[test]
    fn test_user_facing_roundtrip() {
        let ufe = Error::budget_exceeded("token budget exhausted").to_user_facing();
        assert_eq!(ufe.code, "BUDGET_EXCEEDED");
        assert!(!ufe.retriable);

        let json = serde_json::to_string(&ufe).unwrap();
        let back: UserFacingError = serde_json::from_str(&json).unwrap();
        assert_eq!(ufe, back);
    }

    #[test]
    fn test_cycle_detected_message_format() {
        let err = Error::CycleDetected("a, b".into());
        assert!(err.to_string().starts_with("Cycle detected:"));
    }
}
