//! The object storage contract.
//!
//! Every strata component reads and writes through [`StorageBackend`]. Three
//! properties of the contract carry the pipeline:
//!
//! - conditional puts ([`WritePrecondition`]) serialize lease records and
//!   table commits
//! - per-object `etag` and `last_modified` feed incremental change detection
//! - prefix listing drives entity discovery and orphan purges
//!
//! Versions are opaque strings. A backend may use generations, `ETag`s, or
//! version ids; callers only compare them for equality.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Condition a put must satisfy to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// The object must be absent (create).
    DoesNotExist,
    /// The object's current version must equal this token (compare-and-swap).
    MatchesVersion(String),
    /// Always write (last write wins).
    None,
}

/// Outcome of a put.
///
/// A failed precondition is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// The put was applied.
    Success {
        /// Version of the object after the put.
        version: String,
    },
    /// The precondition did not hold; nothing was written.
    PreconditionFailed {
        /// Version observed instead (`"0"` when the object is absent).
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Listing and `head` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Path relative to the backend root.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Token accepted by [`WritePrecondition::MatchesVersion`].
    pub version: String,
    /// Provider modification time, when reported.
    pub last_modified: Option<DateTime<Utc>>,
    /// Provider entity tag, when reported.
    pub etag: Option<String>,
}

/// Object storage used by every strata component.
///
/// Paths use `/` separators and never start with `/`.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads a whole object. Absent objects yield [`Error::NotFound`].
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes an object if `precondition` holds.
    ///
    /// An unmet precondition is reported as
    /// [`WriteResult::PreconditionFailed`], never as an error.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Deleting an absent object succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects whose path starts with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Metadata for one object, `None` when absent.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Deletes every object under `prefix`, returning the number deleted.
    ///
    /// # Errors
    ///
    /// Returns the first listing or delete failure. Objects deleted before the
    /// failure stay deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut objects = self.list(prefix).await?;
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        for object in &objects {
            self.delete(&object.path).await?;
        }
        Ok(objects.len())
    }
}

#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    async fn get(&self, path: &str) -> Result<Bytes> {
        (**self).get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        (**self).put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        (**self).list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        (**self).head(path).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        (**self).delete_prefix(prefix).await
    }
}

/// Process-local backend for tests and dry runs.
///
/// Every write stamps the object with the next value of a backend-wide
/// generation counter starting at 1; the generation is both its version and
/// its etag. Generations never repeat, even across delete and re-create.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<BTreeMap<String, Entry>>>,
    generations: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    generation: u64,
    modified: DateTime<Utc>,
}

impl Entry {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.generation.to_string(),
            last_modified: Some(self.modified),
            etag: Some(format!("\"{}\"", self.generation)),
        }
    }
}

fn missing(path: &str) -> Error {
    Error::NotFound(format!("object not found: {path}"))
}

fn poisoned() -> Error {
    Error::internal("memory backend lock poisoned")
}

impl MemoryBackend {
    /// Empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the modification time of an existing object.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object does not exist.
    pub fn set_last_modified(&self, path: &str, at: DateTime<Utc>) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let entry = objects.get_mut(path).ok_or_else(|| missing(path))?;
        entry.modified = at;
        Ok(())
    }

    /// Every stored path, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Checks `precondition` against the current entry.
    fn admits(current: Option<&Entry>, precondition: &WritePrecondition) -> Option<String> {
        let observed = current.map_or_else(|| "0".to_string(), |e| e.generation.to_string());
        let holds = match (precondition, current) {
            (WritePrecondition::None, _) | (WritePrecondition::DoesNotExist, None) => true,
            (WritePrecondition::DoesNotExist, Some(_)) | (WritePrecondition::MatchesVersion(_), None) => false,
            (WritePrecondition::MatchesVersion(expected), Some(_)) => *expected == observed,
        };
        (!holds).then_some(observed)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects
            .get(path)
            .map(|e| e.data.clone())
            .ok_or_else(|| missing(path))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let current = objects.get(path);
        if let Some(current_version) = Self::admits(current, &precondition) {
            return Ok(WriteResult::PreconditionFailed { current_version });
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        objects.insert(
            path.to_string(),
            Entry {
                data,
                generation,
                modified: Utc::now(),
            },
        );
        Ok(WriteResult::Success {
            version: generation.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, entry)| entry.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|e| e.meta(path)))
    }
}

/// Reads and deserializes a JSON document, returning `None` when absent.
///
/// # Errors
///
/// Returns an error if the read fails for a reason other than absence, or if
/// the document does not parse.
pub async fn read_json<T, S>(storage: &S, path: &str) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
    S: StorageBackend + ?Sized,
{
    let data = match storage.get(path).await {
        Ok(data) => data,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| Error::serialization(format!("parse {path}: {e}")))
}

/// Serializes and writes a JSON document unconditionally (last write wins).
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn write_json<T, S>(storage: &S, path: &str, value: &T) -> Result<String>
where
    T: serde::Serialize + Sync,
    S: StorageBackend + ?Sized,
{
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::serialization(format!("serialize {path}: {e}")))?;
    match storage
        .put(path, Bytes::from(body), WritePrecondition::None)
        .await?
    {
        WriteResult::Success { version } => Ok(version),
        WriteResult::PreconditionFailed { current_version } => Err(Error::PreconditionFailed {
            message: format!("unconditional write to {path} rejected at {current_version}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(backend: &MemoryBackend, path: &str, body: &str, pre: WritePrecondition) -> WriteResult {
        backend
            .put(path, Bytes::from(body.to_string()), pre)
            .await
            .expect("put")
    }

    #[tokio::test]
    async fn generations_advance_on_every_write() {
        let backend = MemoryBackend::new();
        let first = put(&backend, "raw/AAPL.csv", "a", WritePrecondition::None).await;
        let second = put(&backend, "raw/AAPL.csv", "ab", WritePrecondition::None).await;
        assert_eq!(first, WriteResult::Success { version: "1".into() });
        assert_eq!(second, WriteResult::Success { version: "2".into() });

        assert_eq!(backend.get("raw/AAPL.csv").await.expect("get"), Bytes::from("ab"));
        let meta = backend.head("raw/AAPL.csv").await.expect("head").expect("present");
        assert_eq!(meta.size, 2);
        assert_eq!(meta.version, "2");
        assert_eq!(meta.etag.as_deref(), Some("\"2\""));
        assert!(meta.last_modified.is_some());
        assert!(backend.get("raw/MSFT.csv").await.expect_err("absent").is_not_found());
    }

    #[tokio::test]
    async fn recreated_object_gets_a_fresh_version() {
        let backend = MemoryBackend::new();
        let WriteResult::Success { version: first } =
            put(&backend, "raw/AAPL.csv", "a", WritePrecondition::None).await
        else {
            panic!("expected success");
        };
        backend.delete("raw/AAPL.csv").await.expect("delete");
        let WriteResult::Success { version: second } =
            put(&backend, "raw/AAPL.csv", "a", WritePrecondition::None).await
        else {
            panic!("expected success");
        };
        assert_ne!(first, second);

        let meta = backend.head("raw/AAPL.csv").await.expect("head").expect("present");
        assert_ne!(meta.etag.as_deref(), Some(format!("\"{first}\"").as_str()));
        let stale = put(
            &backend,
            "raw/AAPL.csv",
            "b",
            WritePrecondition::MatchesVersion(first),
        )
        .await;
        assert!(!stale.is_success());
    }

    #[tokio::test]
    async fn create_only_lets_one_writer_win() {
        let backend = MemoryBackend::new();
        let winner = put(&backend, "_delta_log/1.json", "a", WritePrecondition::DoesNotExist).await;
        let loser = put(&backend, "_delta_log/1.json", "b", WritePrecondition::DoesNotExist).await;
        assert!(winner.is_success());
        assert_eq!(
            loser,
            WriteResult::PreconditionFailed {
                current_version: "1".into()
            }
        );
        assert_eq!(backend.get("_delta_log/1.json").await.expect("get"), Bytes::from("a"));
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_versions() {
        let backend = MemoryBackend::new();
        put(&backend, "locks/job.lease.json", "v1", WritePrecondition::None).await;

        let swapped = put(
            &backend,
            "locks/job.lease.json",
            "v2",
            WritePrecondition::MatchesVersion("1".into()),
        )
        .await;
        assert!(swapped.is_success());

        let stale = put(
            &backend,
            "locks/job.lease.json",
            "v3",
            WritePrecondition::MatchesVersion("1".into()),
        )
        .await;
        assert!(!stale.is_success());

        let absent = put(
            &backend,
            "locks/other.lease.json",
            "v1",
            WritePrecondition::MatchesVersion("1".into()),
        )
        .await;
        assert_eq!(
            absent,
            WriteResult::PreconditionFailed {
                current_version: "0".into()
            }
        );
    }

    #[tokio::test]
    async fn prefix_listing_does_not_bleed_into_siblings() {
        let backend = MemoryBackend::new();
        for path in ["a/1.txt", "a/2.txt", "ab/3.txt", "b/1.txt"] {
            put(&backend, path, "x", WritePrecondition::None).await;
        }

        assert_eq!(backend.list("a/").await.expect("list").len(), 2);
        assert_eq!(backend.delete_prefix("a/").await.expect("delete prefix"), 2);
        assert_eq!(backend.paths(), vec!["ab/3.txt", "b/1.txt"]);
        backend.delete("a/1.txt").await.expect("absent delete is fine");
    }

    #[tokio::test]
    async fn json_documents_read_back_or_are_absent() {
        let backend = MemoryBackend::new();
        let missing: Option<serde_json::Value> =
            read_json(&backend, "state/doc.json").await.expect("read");
        assert!(missing.is_none());

        write_json(&backend, "state/doc.json", &serde_json::json!({"a": 1}))
            .await
            .expect("write");
        let doc: Option<serde_json::Value> =
            read_json(&backend, "state/doc.json").await.expect("read");
        assert_eq!(doc, Some(serde_json::json!({"a": 1})));

        put(&backend, "state/bad.json", "{not json", WritePrecondition::None).await;
        assert!(read_json::<serde_json::Value, _>(&backend, "state/bad.json").await.is_err());
    }

    #[tokio::test]
    async fn modification_time_can_be_pinned() {
        let backend = MemoryBackend::new();
        put(&backend, "x", "x", WritePrecondition::None).await;
        let at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        backend.set_last_modified("x", at).expect("touch");
        let meta = backend.head("x").await.expect("head").expect("exists");
        assert_eq!(meta.last_modified, Some(at));
        assert!(backend.set_last_modified("missing", at).is_err());
    }
}
