//! Entity blacklist.
//!
//! Entities the provider reported as permanently absent (HTTP 404) are
//! recorded per collection so later runs skip them without spending quota:
//!
//! ```text
//! state/blacklist/{collection}.json
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{StorageBackend, read_json, write_json};

use crate::error::{Result, StateError, validate_key};

/// Prefix for blacklist documents.
pub const BLACKLIST_PREFIX: &str = "state/blacklist";

/// Schema version written by this build.
pub const BLACKLIST_VERSION: u32 = 1;

/// Returns the storage path of a collection's blacklist.
#[must_use]
pub fn blacklist_path(collection: &str) -> String {
    format!("{BLACKLIST_PREFIX}/{collection}.json")
}

/// Why an entity was blacklisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistEntry {
    /// Provider detail, truncated.
    pub reason: String,
    /// When the entity was added.
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlacklistDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    entities: BTreeMap<String, BlacklistEntry>,
}

/// In-memory blacklist for one collection.
#[derive(Debug, Clone)]
pub struct EntityBlacklist {
    collection: String,
    entities: BTreeMap<String, BlacklistEntry>,
    dirty: bool,
}

impl EntityBlacklist {
    /// Creates an empty blacklist.
    #[must_use]
    pub fn empty(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            entities: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Returns true if `entity` is blacklisted.
    #[must_use]
    pub fn contains(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    /// Returns the entry for `entity`.
    #[must_use]
    pub fn get(&self, entity: &str) -> Option<&BlacklistEntry> {
        self.entities.get(entity)
    }

    /// Adds `entity`. Returns false if it was already present.
    pub fn add(&mut self, entity: impl Into<String>, reason: impl Into<String>) -> bool {
        let entity = entity.into();
        if self.entities.contains_key(&entity) {
            return false;
        }
        self.entities.insert(
            entity,
            BlacklistEntry {
                reason: strata_core::observability::truncate_detail(&reason.into()),
                added_at: Utc::now(),
            },
        );
        self.dirty = true;
        true
    }

    /// Removes `entity`. Returns true if it was present.
    pub fn remove(&mut self, entity: &str) -> bool {
        let removed = self.entities.remove(entity).is_some();
        self.dirty |= removed;
        removed
    }

    /// Iterates blacklisted entities in order.
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Returns the number of blacklisted entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if nothing is blacklisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Returns true if the blacklist changed since it was loaded.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Loads and persists blacklists.
#[derive(Clone)]
pub struct BlacklistStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for BlacklistStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlacklistStore").finish_non_exhaustive()
    }
}

impl BlacklistStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Loads a collection's blacklist; a missing document is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid, the read fails, or the version
    /// is unsupported.
    pub async fn load(&self, collection: &str) -> Result<EntityBlacklist> {
        validate_key(collection)?;
        let path = blacklist_path(collection);
        let Some(document) =
            read_json::<BlacklistDocument, _>(self.storage.as_ref(), &path).await?
        else {
            return Ok(EntityBlacklist::empty(collection));
        };
        if document.version != BLACKLIST_VERSION {
            return Err(StateError::UnsupportedVersion {
                kind: "blacklist",
                path,
                found: document.version,
                expected: BLACKLIST_VERSION,
            });
        }
        Ok(EntityBlacklist {
            collection: collection.to_string(),
            entities: document.entities,
            dirty: false,
        })
    }

    /// Writes the blacklist if dirty. Returns true if a write happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn persist(&self, blacklist: &mut EntityBlacklist) -> Result<bool> {
        if !blacklist.dirty {
            return Ok(false);
        }
        validate_key(&blacklist.collection)?;
        let document = BlacklistDocument {
            version: BLACKLIST_VERSION,
            updated_at: Utc::now(),
            entities: blacklist.entities.clone(),
        };
        write_json(
            self.storage.as_ref(),
            &blacklist_path(&blacklist.collection),
            &document,
        )
        .await?;
        blacklist.dirty = false;
        tracing::info!(
            collection = %blacklist.collection,
            entities = blacklist.entities.len(),
            "persisted blacklist"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::MemoryBackend;

    #[tokio::test]
    async fn add_persist_reload() {
        let store = BlacklistStore::new(Arc::new(MemoryBackend::new()));
        let mut list = store.load("bronze").await.expect("load");
        assert!(list.is_empty());

        assert!(list.add("DELISTED", "404: symbol not found"));
        assert!(!list.add("DELISTED", "again"));
        assert!(store.persist(&mut list).await.expect("persist"));
        assert!(!store.persist(&mut list).await.expect("persist clean"));

        let reloaded = store.load("bronze").await.expect("reload");
        assert!(reloaded.contains("DELISTED"));
        assert_eq!(
            reloaded.get("DELISTED").map(|e| e.reason.as_str()),
            Some("404: symbol not found")
        );
    }

    #[test]
    fn long_reasons_are_truncated() {
        let mut list = EntityBlacklist::empty("bronze");
        list.add("X", "y".repeat(5_000));
        let reason = &list.get("X").expect("entry").reason;
        assert!(reason.len() < 600);
    }

    #[test]
    fn remove_marks_dirty() {
        let mut list = EntityBlacklist::empty("bronze");
        assert!(!list.remove("X"));
        assert!(!list.is_dirty());
        list.add("X", "gone");
        assert!(list.remove("X"));
        assert!(list.is_dirty());
    }
}
