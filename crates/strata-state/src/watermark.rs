//! Watermark documents.
//!
//! One JSON document per logical collection maps each source key to the
//! signature last processed successfully:
//!
//! ```text
//! state/watermarks/{collection}.json
//! ```
//!
//! A job loads the document once at start, records signatures in memory as
//! sources are processed, and persists it once at the end if anything changed.
//! The store has no locking of its own; concurrent executions against the
//! same collection must be serialized with a `LeaseLock`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{StorageBackend, read_json, write_json};

use crate::error::{Result, StateError, validate_key};
use crate::signature::Signature;

/// Prefix for watermark documents.
pub const WATERMARK_PREFIX: &str = "state/watermarks";

/// Schema version written by this build.
pub const WATERMARK_VERSION: u32 = 1;

/// Returns the storage path of a collection's watermark document.
#[must_use]
pub fn watermark_path(collection: &str) -> String {
    format!("{WATERMARK_PREFIX}/{collection}.json")
}

/// Signature of one source key plus when it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkEntry {
    /// Observed signature.
    #[serde(flatten)]
    pub signature: Signature,
    /// When the signature was recorded.
    pub updated_at: DateTime<Utc>,
}

/// Persisted watermark document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkDocument {
    /// Schema version.
    pub version: u32,
    /// When the document was last written.
    pub updated_at: DateTime<Utc>,
    /// Signatures by source key.
    #[serde(default)]
    pub items: BTreeMap<String, WatermarkEntry>,
}

impl Default for WatermarkDocument {
    fn default() -> Self {
        Self {
            version: WATERMARK_VERSION,
            updated_at: Utc::now(),
            items: BTreeMap::new(),
        }
    }
}

/// In-memory working copy of a collection's watermarks.
#[derive(Debug, Clone)]
pub struct Watermarks {
    collection: String,
    document: WatermarkDocument,
    dirty: bool,
}

impl Watermarks {
    /// Creates an empty working copy.
    #[must_use]
    pub fn empty(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document: WatermarkDocument::default(),
            dirty: false,
        }
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the signature recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Signature> {
        self.document.items.get(key).map(|e| &e.signature)
    }

    /// Returns the full entry for `key`.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&WatermarkEntry> {
        self.document.items.get(key)
    }

    /// Records the signature observed for `key` after successful processing.
    ///
    /// Recording an identical signature does not mark the document dirty.
    pub fn record(&mut self, key: impl Into<String>, signature: Signature) {
        let key = key.into();
        if self
            .document
            .items
            .get(&key)
            .is_some_and(|existing| existing.signature == signature)
        {
            return;
        }
        self.document.items.insert(
            key,
            WatermarkEntry {
                signature,
                updated_at: Utc::now(),
            },
        );
        self.dirty = true;
    }

    /// Forgets `key`. Returns true if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let removed = self.document.items.remove(key).is_some();
        self.dirty |= removed;
        removed
    }

    /// Returns true if the working copy differs from what was loaded.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.document.items.len()
    }

    /// Returns true if no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document.items.is_empty()
    }

    /// Iterates tracked keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.document.items.keys().map(String::as_str)
    }

    /// Returns the underlying document.
    #[must_use]
    pub fn document(&self) -> &WatermarkDocument {
        &self.document
    }
}

/// Loads and persists watermark documents.
#[derive(Clone)]
pub struct WatermarkStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for WatermarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkStore").finish_non_exhaustive()
    }
}

impl WatermarkStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Loads a collection's watermarks; a missing document is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid, the read fails, or the
    /// document has an unsupported version.
    pub async fn load(&self, collection: &str) -> Result<Watermarks> {
        validate_key(collection)?;
        let path = watermark_path(collection);
        let document: Option<WatermarkDocument> = read_json(self.storage.as_ref(), &path).await?;

        let Some(document) = document else {
            tracing::debug!(collection, "no watermark document; starting empty");
            return Ok(Watermarks::empty(collection));
        };

        if document.version != WATERMARK_VERSION {
            return Err(StateError::UnsupportedVersion {
                kind: "watermark",
                path,
                found: document.version,
                expected: WATERMARK_VERSION,
            });
        }

        tracing::debug!(collection, items = document.items.len(), "loaded watermarks");
        Ok(Watermarks {
            collection: collection.to_string(),
            document,
            dirty: false,
        })
    }

    /// Writes the document if dirty. Returns true if a write happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; the working copy stays dirty.
    pub async fn persist(&self, watermarks: &mut Watermarks) -> Result<bool> {
        if !watermarks.dirty {
            return Ok(false);
        }
        validate_key(&watermarks.collection)?;

        let path = watermark_path(&watermarks.collection);
        watermarks.document.version = WATERMARK_VERSION;
        watermarks.document.updated_at = Utc::now();
        write_json(self.storage.as_ref(), &path, &watermarks.document).await?;
        watermarks.dirty = false;

        tracing::info!(
            collection = %watermarks.collection,
            items = watermarks.document.items.len(),
            "persisted watermarks"
        );
        Ok(true)
    }
}
