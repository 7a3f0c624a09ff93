//! Shared types: identifiers, errors, configuration.

pub mod config;
pub mod errors;
pub mod ids;

pub use config::{CircuitBreakerConfig, MemoryConfig, RuntimeConfig};
pub use errors::{Error, Result, UserFacingError};
pub use ids::{
    ComponentId, ConversationId, CorrelationId, JobId, MessageId, PlanId, RuleId, WorkerId,
};

use chrono::{DateTime, TimeZone, Utc};

/// Current time truncated to millisecond precision.
///
/// Envelope timestamps are RFC-3339 with milliseconds; truncating at
/// construction keeps the signing input stable across serde round-trips.
pub fn now_ms() -> DateTime<Utc> {
    let now = Utc::now();
    match Utc.timestamp_millis_opt(now.timestamp_millis()).single() {
        Some(t) => t,
        None => now,
    }
}

/// RFC-3339 rendering with fixed millisecond precision, as signed.
pub fn rfc3339_ms(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
