//! Error types for job orchestration.
//!
//! Gateway failures keep the provider's status, detail, and payload so a
//! caller can tell a permanent absence (blacklist the entity) from a transient
//! outage (retry later).

use std::fmt;

use strata_core::observability::truncate_detail;

/// The result type used throughout strata-flow.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Gateway failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayErrorKind {
    /// 401 or 403.
    Auth,
    /// 404: the entity does not exist upstream.
    NotFound,
    /// 429.
    RateLimited,
    /// 503, or the readiness gate failed.
    Unavailable,
    /// Any other non-success status.
    Other,
    /// Connection, TLS, or timeout failure before a status arrived.
    Transport,
    /// The response body could not be decoded.
    Decode,
}

impl GatewayErrorKind {
    /// Maps an HTTP status to a category.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            503 => Self::Unavailable,
            _ => Self::Other,
        }
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Other => "other",
            Self::Transport => "transport",
            Self::Decode => "decode",
        }
    }
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed gateway call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("gateway {kind} error (status {}): {detail}", status.map_or_else(|| "none".to_string(), |s| s.to_string()))]
pub struct GatewayError {
    /// Category.
    pub kind: GatewayErrorKind,
    /// HTTP status, when one was received.
    pub status: Option<u16>,
    /// Provider-supplied detail, truncated.
    pub detail: String,
    /// Structured response body, when it was JSON.
    pub payload: Option<serde_json::Value>,
}

impl GatewayError {
    /// Builds an error from a non-success response body.
    ///
    /// The detail is taken from a JSON `detail`, `message`, or `error` field
    /// when present, otherwise from the raw body.
    #[must_use]
    pub fn from_response(status: u16, body: &str) -> Self {
        let payload = serde_json::from_str::<serde_json::Value>(body).ok();
        let detail = payload
            .as_ref()
            .and_then(|p| {
                ["detail", "message", "error"]
                    .iter()
                    .find_map(|k| p.get(k).and_then(serde_json::Value::as_str))
            })
            .map_or_else(|| body.trim().to_string(), ToString::to_string);
        Self {
            kind: GatewayErrorKind::from_status(status),
            status: Some(status),
            detail: truncate_detail(&detail),
            payload,
        }
    }

    /// Builds an error with no response.
    pub fn without_status(kind: GatewayErrorKind, detail: impl AsRef<str>) -> Self {
        Self {
            kind,
            status: None,
            detail: truncate_detail(detail.as_ref()),
            payload: None,
        }
    }

    /// Gateway not ready; the request was not attempted.
    pub fn unavailable(detail: impl AsRef<str>) -> Self {
        Self::without_status(GatewayErrorKind::Unavailable, detail)
    }

    /// Returns true if retrying later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            GatewayErrorKind::RateLimited
            | GatewayErrorKind::Unavailable
            | GatewayErrorKind::Transport => true,
            GatewayErrorKind::Other => self.status.is_some_and(|s| s >= 500 || s == 408),
            GatewayErrorKind::Auth | GatewayErrorKind::NotFound | GatewayErrorKind::Decode => {
                false
            }
        }
    }

    /// Returns true if the entity does not exist upstream.
    #[must_use]
    pub fn is_permanent_absence(&self) -> bool {
        self.kind == GatewayErrorKind::NotFound
    }
}

/// A downstream job could not be started.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TriggerError {
    /// No control-plane URL is configured.
    #[error("job trigger requires a control-plane URL")]
    NotConfigured,

    /// The start request failed after all attempts.
    #[error("failed to start job {job} after {attempts} attempt(s): {detail}")]
    StartFailed {
        /// Job that failed to start.
        job: String,
        /// Attempts made.
        attempts: u32,
        /// Last HTTP status, if any.
        status: Option<u16>,
        /// Truncated failure detail.
        detail: String,
    },

    /// The HTTP client could not be built.
    #[error("job trigger client error: {0}")]
    Client(String),
}

/// Errors from job orchestration.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Storage or configuration failure from the core layer.
    #[error(transparent)]
    Core(#[from] strata_core::Error),

    /// State document failure.
    #[error(transparent)]
    State(#[from] strata_state::StateError),

    /// Table failure.
    #[error(transparent)]
    Table(#[from] strata_table::TableError),

    /// Lock failure.
    #[error(transparent)]
    Lock(#[from] strata_core::LockError),

    /// Gateway failure.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Downstream trigger failure.
    #[error(transparent)]
    Trigger(#[from] TriggerError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Job-specific failure.
    #[error("job failed: {0}")]
    Job(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_maps_to_kind() {
        assert_eq!(GatewayErrorKind::from_status(401), GatewayErrorKind::Auth);
        assert_eq!(GatewayErrorKind::from_status(403), GatewayErrorKind::Auth);
        assert_eq!(GatewayErrorKind::from_status(404), GatewayErrorKind::NotFound);
        assert_eq!(GatewayErrorKind::from_status(429), GatewayErrorKind::RateLimited);
        assert_eq!(GatewayErrorKind::from_status(503), GatewayErrorKind::Unavailable);
        assert_eq!(GatewayErrorKind::from_status(500), GatewayErrorKind::Other);
    }

    #[test]
    fn detail_comes_from_json_fields() {
        let err = GatewayError::from_response(404, r#"{"detail":"unknown symbol ZZZZ","code":7}"#);
        assert!(err.is_permanent_absence());
        assert!(!err.is_retryable());
        assert_eq!(err.detail, "unknown symbol ZZZZ");
        assert_eq!(err.payload.as_ref().and_then(|p| p["code"].as_i64()), Some(7));

        let err = GatewayError::from_response(502, "bad gateway\n");
        assert_eq!(err.detail, "bad gateway");
        assert!(err.payload.is_none());
        assert!(err.is_retryable());
    }

    #[test]
    fn long_detail_is_truncated() {
        let body = "x".repeat(4096);
        let err = GatewayError::from_response(500, &body);
        assert!(err.detail.len() < 600);
        assert!(err.to_string().contains("status 500"));
    }

    #[test]
    fn rate_limit_and_unavailable_are_retryable() {
        assert!(GatewayError::from_response(429, "").is_retryable());
        assert!(GatewayError::unavailable("not ready").is_retryable());
        assert!(!GatewayError::from_response(401, "").is_retryable());
    }
}
