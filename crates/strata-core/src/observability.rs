//! Logging initialization and span helpers.
//!
//! Every job logs through `tracing` with a consistent set of span fields so a
//! failure line always names the job, the execution, and the resource.

use std::fmt;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Maximum length of an error or provider detail string in logs.
pub const MAX_DETAIL_LEN: usize = 512;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown log format: {other}"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log levels (default `info`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_fmt::layer().pretty())
                .try_init(),
        };
        // A global subscriber may already be installed (tests, embedding).
        let _ = result;
    });
}

/// Creates the root span for one job execution.
///
/// ```rust
/// use strata_core::observability::job_span;
///
/// let span = job_span("bronze_market_data", "exec-01", "acme");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn job_span(job: &str, execution: &str, tenant: &str) -> Span {
    tracing::info_span!("job", job = job, execution = execution, tenant = tenant)
}

/// Creates a span for a table operation.
#[must_use]
pub fn table_span(operation: &str, table: &str) -> Span {
    tracing::info_span!("table", op = operation, table = table)
}

/// Truncates an error or detail string to [`MAX_DETAIL_LEN`] characters.
#[must_use]
pub fn truncate_detail(detail: &str) -> String {
    match detail.char_indices().nth(MAX_DETAIL_LEN) {
        Some((idx, _)) => format!("{}...", &detail[..idx]),
        None => detail.to_string(),
    }
}

/// Wrapper that never prints its contents.
///
/// Used for API keys and tokens held in configuration.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Redacted<T>(T);

impl<T> Redacted<T> {
    /// Wraps a secret.
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Returns the secret. Never log the result.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> From<T> for Redacted<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}
