//! Observed state of a source object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::ObjectMeta;

/// Identifies the observed state of one source object.
///
/// Two signatures match when their etags are equal, or when their
/// modification times are equal. Either is enough: backends that rotate etags
/// without a content change still compare equal on modification time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    /// Entity tag reported by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Last modification time reported by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Signature {
    /// Creates a signature.
    #[must_use]
    pub fn new(etag: Option<String>, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }

    /// Computes the signature of an object from its live metadata.
    #[must_use]
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            etag: meta.etag.clone(),
            last_modified: meta.last_modified,
        }
    }

    /// Returns true if this signature describes the same object state as `other`.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        let etag_match = matches!(
            (&self.etag, &other.etag),
            (Some(a), Some(b)) if a == b
        );
        let modified_match = matches!(
            (self.last_modified, other.last_modified),
            (Some(a), Some(b)) if a == b
        );
        etag_match || modified_match
    }
}

impl From<&ObjectMeta> for Signature {
    fn from(meta: &ObjectMeta) -> Self {
        Self::from_meta(meta)
    }
}
