//! Tracing setup for the orchestration core.
//!
//! Components log structured fields (job ids, gear ids, verdicts) rather
//! than formatted strings, so the subscriber choice here is mostly about
//! output shape: compact text for interactive use, JSON when the
//! embedder ships logs somewhere. Secret values never reach this layer;
//! the vault and sandbox redact before logging.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output shape for the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact single-line text.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Resolve from `AEGIS_LOG_FORMAT`; anything but `json` means text.
    pub fn from_env() -> Self {
        match std::env::var("AEGIS_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

static SUBSCRIBER_INSTALLED: OnceLock<LogFormat> = OnceLock::new();

/// Install the global subscriber with the format from the environment.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`. Safe to call from
/// every entry point (workers, tests, the embedding binary); only the
/// first call installs anything.
pub fn init_tracing() {
    init_tracing_with(LogFormat::from_env());
}

/// Install the global subscriber with an explicit format. Returns the
/// format that actually won (the first caller's, on repeat calls).
pub fn init_tracing_with(format: LogFormat) -> LogFormat {
    *SUBSCRIBER_INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        let installed = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Text => registry.with(fmt::layer().compact()).try_init(),
        };
        // A subscriber set by the embedding application wins silently.
        if installed.is_err() {
            tracing::debug!("global subscriber already set; keeping it");
        }
        format
    })
}
