//! Error types for state documents.

use thiserror::Error;

/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur while loading or persisting state documents.
#[derive(Debug, Error)]
pub enum StateError {
    /// Storage or serialization failure from the core layer.
    #[error(transparent)]
    Core(#[from] strata_core::Error),

    /// A document was written by an incompatible schema version.
    #[error("unsupported {kind} document version {found} at {path} (expected {expected})")]
    UnsupportedVersion {
        /// Document kind (watermark, blacklist).
        kind: &'static str,
        /// Storage path.
        path: String,
        /// Version found.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// A collection or job name cannot be used as a path segment.
    #[error("invalid state key: {message}")]
    InvalidKey {
        /// Why the key was rejected.
        message: String,
    },
}

/// Validates a collection or job name used as a document key.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StateError::InvalidKey {
            message: "key cannot be empty".to_string(),
        });
    }
    if key.contains('/') || key.contains('\\') || key == "." || key == ".." {
        return Err(StateError::InvalidKey {
            message: format!("key '{key}' must be a single path segment"),
        });
    }
    if key.chars().any(char::is_control) {
        return Err(StateError::InvalidKey {
            message: format!("key {key:?} contains control characters"),
        });
    }
    Ok(())
}
