//! The error type shared by every strata crate.
//!
//! Crates further up (`strata-state`, `strata-table`, `strata-flow`) wrap
//! [`Error`] in their own enums with `#[from]`.

/// Result alias over [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value failed validation (tenant id, month, wait policy, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The object or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write lost; the message names the object.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// What was being written.
        message: String,
    },

    /// The storage backend failed.
    #[error("storage error: {message}")]
    Storage {
        /// What was attempted.
        message: String,
        /// Backend error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A JSON document could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Document and parser detail.
        message: String,
    },

    /// A storage location or setting cannot be used.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An invariant broke (for example a poisoned lock).
    #[error("internal error: {message}")]
    Internal {
        /// Detail.
        message: String,
    },
}

impl Error {
    /// Backend failure without an underlying error value.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Backend failure caused by `source`.
    #[must_use]
    pub fn storage_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Encoding or decoding failure.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Broken invariant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for [`Error::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_found_is_absence() {
        assert!(Error::NotFound("state/watermarks/x.json".into()).is_not_found());
        assert!(!Error::storage("boom").is_not_found());
        assert!(!Error::PreconditionFailed { message: "x".into() }.is_not_found());
    }

    #[test]
    fn storage_error_keeps_its_cause() {
        let io = std::io::Error::other("disk gone");
        let err = Error::storage_with_source("put tenant=a/x failed", io);
        assert_eq!(err.to_string(), "storage error: put tenant=a/x failed");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("disk gone"));
    }
}
