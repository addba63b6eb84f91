//! Error types for table operations.

use thiserror::Error;

/// Result type alias for table operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// Errors that can occur during table operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Storage failure from the core layer.
    #[error(transparent)]
    Core(#[from] strata_core::Error),

    /// The table has no commit log.
    #[error("table not found: {table}")]
    NotFound {
        /// Table root.
        table: String,
    },

    /// The written data does not fit the table schema.
    #[error("schema mismatch writing {table}: {}", details.join("; "))]
    SchemaMismatch {
        /// Table root.
        table: String,
        /// One entry per offending column.
        details: Vec<String>,
    },

    /// Another writer committed the same version first.
    #[error("commit conflict on {table} at version {version}")]
    CommitConflict {
        /// Table root.
        table: String,
        /// Version that was already taken.
        version: u64,
    },

    /// A commit log entry could not be interpreted.
    #[error("invalid commit log entry {path}: {message}")]
    InvalidLog {
        /// Log entry path.
        path: String,
        /// What was wrong.
        message: String,
    },

    /// A write predicate is malformed or the data violates it.
    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    /// A frame is missing a required column or has the wrong shape.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Arrow compute failure.
    #[error("arrow error: {message}")]
    Arrow {
        /// Description of the failure.
        message: String,
    },

    /// Parquet encode or decode failure.
    #[error("parquet error: {message}")]
    Parquet {
        /// Description of the failure.
        message: String,
    },
}

impl TableError {
    /// Wraps an arrow error with context.
    pub(crate) fn arrow(context: &str, err: &arrow::error::ArrowError) -> Self {
        Self::Arrow {
            message: format!("{context}: {err}"),
        }
    }

    /// Returns true if the table does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_mismatch_lists_columns() {
        let err = TableError::SchemaMismatch {
            table: "gold/by_date".into(),
            details: vec![
                "column close: table Float64, write Utf8".into(),
                "missing column volume".into(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("close"));
        assert!(msg.contains("volume"));
    }
}
