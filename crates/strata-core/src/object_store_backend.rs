//! [`StorageBackend`] implementation over the `object_store` crate.
//!
//! Supported locations:
//! - `memory://` (process-local, tests and dry runs)
//! - `file:///abs/path` or a bare filesystem path
//! - `s3://bucket[/prefix]`, `gs://bucket[/prefix]`, `az://container[/prefix]`
//!   (credentials from the standard provider environment variables)
//!
//! The version token is the provider `ETag` (falling back to the object version).
//! Cloud providers and `memory://` apply `MatchesVersion` natively. The local
//! filesystem store has no conditional update, so version-matched writes there
//! run under a per-object guard file created with exclusive-create semantics
//! under `.strata-guards/`; guards older than [`GUARD_STALE_AFTER`] are
//! treated as left behind by a crashed writer and removed.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Directory, relative to a local storage root, holding write guards.
const GUARD_DIR: &str = ".strata-guards";

/// Age after which a write guard is considered abandoned.
pub const GUARD_STALE_AFTER: Duration = Duration::from_secs(10);

const GUARD_POLL: Duration = Duration::from_millis(5);
const GUARD_WAIT: Duration = Duration::from_secs(2);

/// Object storage backend built on `object_store`.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    root: String,
    guards: Option<PathBuf>,
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("store", &self.store.to_string())
            .field("root", &self.root)
            .field("guards", &self.guards)
            .finish()
    }
}

impl ObjectStoreBackend {
    /// Wraps an existing object store, rooting every path under `root`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<String>) -> Self {
        let root = root.into().trim_matches('/').to_string();
        Self {
            store,
            root,
            guards: None,
        }
    }

    /// Builds a backend from a location URL (see module docs).
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for an unsupported scheme or if the
    /// provider builder rejects its environment.
    pub fn from_url(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(Error::Configuration("storage location is empty".into()));
        }

        let (scheme, rest) = location.split_once("://").unwrap_or(("file", location));
        let (bucket, root) = rest.split_once('/').unwrap_or((rest, ""));

        let store: Arc<dyn ObjectStore> = match scheme {
            "memory" => Arc::new(InMemory::new()),
            "file" => {
                let dir = if rest.starts_with('/') {
                    rest.to_string()
                } else {
                    format!("/{rest}")
                };
                let guards = PathBuf::from(&dir).join(GUARD_DIR);
                std::fs::create_dir_all(&guards).map_err(|e| {
                    Error::Configuration(format!("cannot create storage dir {dir}: {e}"))
                })?;
                let fs = LocalFileSystem::new_with_prefix(&dir).map_err(|e| {
                    Error::Configuration(format!("invalid local storage dir {dir}: {e}"))
                })?;
                return Ok(Self {
                    guards: Some(guards),
                    ..Self::new(Arc::new(fs), "")
                });
            }
            "s3" => Arc::new(
                AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .build()
                    .map_err(|e| Error::Configuration(format!("s3 backend: {e}")))?,
            ),
            "gs" => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()
                    .map_err(|e| Error::Configuration(format!("gcs backend: {e}")))?,
            ),
            "az" | "abfs" => Arc::new(
                MicrosoftAzureBuilder::from_env()
                    .with_container_name(bucket)
                    .build()
                    .map_err(|e| Error::Configuration(format!("azure backend: {e}")))?,
            ),
            other => {
                return Err(Error::Configuration(format!(
                    "unsupported storage scheme: {other}"
                )));
            }
        };

        Ok(Self::new(store, root))
    }

    fn location(&self, path: &str) -> Path {
        let path = path.trim_start_matches('/');
        if self.root.is_empty() {
            Path::from(path)
        } else {
            Path::from(format!("{}/{path}", self.root))
        }
    }

    fn relative(&self, location: &Path) -> String {
        let full = location.as_ref();
        if self.root.is_empty() {
            return full.to_string();
        }
        full.strip_prefix(&self.root)
            .map(|p| p.trim_start_matches('/').to_string())
            .unwrap_or_else(|| full.to_string())
    }

    fn to_meta(&self, meta: object_store::ObjectMeta) -> ObjectMeta {
        let version = meta
            .e_tag
            .clone()
            .or_else(|| meta.version.clone())
            .unwrap_or_else(|| meta.last_modified.timestamp_micros().to_string());
        ObjectMeta {
            path: self.relative(&meta.location),
            size: meta.size as u64,
            version,
            last_modified: Some(meta.last_modified),
            etag: meta.e_tag,
        }
    }

    async fn current_version(&self, path: &str) -> String {
        match self.head(path).await {
            Ok(Some(meta)) => meta.version,
            _ => "0".to_string(),
        }
    }

    async fn written(&self, path: &str, result: object_store::PutResult) -> WriteResult {
        let version = match result.e_tag.or(result.version) {
            Some(version) => version,
            None => self.current_version(path).await,
        };
        WriteResult::Success { version }
    }

    /// Compare-and-swap for stores without conditional update.
    async fn put_guarded(
        &self,
        guards: &std::path::Path,
        path: &str,
        data: Bytes,
        expected: &str,
    ) -> Result<WriteResult> {
        let guard = guards.join(path.replace('/', "__"));
        if !take_guard(&guard).await? {
            return Ok(WriteResult::PreconditionFailed {
                current_version: self.current_version(path).await,
            });
        }

        let outcome = self.swap(path, data, expected).await;
        if let Err(e) = tokio::fs::remove_file(&guard).await {
            tracing::warn!(guard = %guard.display(), error = %e, "write guard not removed");
        }
        outcome
    }

    async fn swap(&self, path: &str, data: Bytes, expected: &str) -> Result<WriteResult> {
        match self.head(path).await? {
            Some(meta) if meta.version == expected => {}
            Some(meta) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: meta.version,
                });
            }
            None => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: "0".to_string(),
                });
            }
        }
        let result = self
            .store
            .put_opts(&self.location(path), PutPayload::from(data), PutOptions::default())
            .await
            .map_err(|e| map_err(path, e))?;
        Ok(self.written(path, result).await)
    }
}

/// Creates `guard` exclusively, waiting up to [`GUARD_WAIT`] for a live
/// holder. Returns false if the guard stayed held.
async fn take_guard(guard: &std::path::Path) -> Result<bool> {
    let started = tokio::time::Instant::now();
    loop {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(guard)
            .await
        {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(Error::storage_with_source(
                    format!("cannot create write guard {}", guard.display()),
                    e,
                ));
            }
        }

        if guard_abandoned(guard).await {
            tracing::warn!(guard = %guard.display(), "removing abandoned write guard");
            let _ = tokio::fs::remove_file(guard).await;
            continue;
        }
        if started.elapsed() >= GUARD_WAIT {
            return Ok(false);
        }
        tokio::time::sleep(GUARD_POLL).await;
    }
}

async fn guard_abandoned(guard: &std::path::Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(guard).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|at| SystemTime::now().duration_since(at).ok())
        .is_some_and(|age| age >= GUARD_STALE_AFTER)
}

fn map_err(path: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::NotFound(format!("object not found: {path}")),
        other => Error::storage_with_source(format!("object store operation on {path} failed"), other),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = self.location(path);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_err(path, e))?;
        result.bytes().await.map_err(|e| map_err(path, e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        if let (Some(guards), WritePrecondition::MatchesVersion(expected)) =
            (&self.guards, &precondition)
        {
            return self.put_guarded(guards, path, data, expected).await;
        }

        let mode = match precondition {
            WritePrecondition::DoesNotExist => PutMode::Create,
            WritePrecondition::MatchesVersion(version) => PutMode::Update(UpdateVersion {
                e_tag: Some(version),
                version: None,
            }),
            WritePrecondition::None => PutMode::Overwrite,
        };
        let options = PutOptions {
            mode,
            ..PutOptions::default()
        };

        match self
            .store
            .put_opts(&self.location(path), PutPayload::from(data), options)
            .await
        {
            Ok(result) => Ok(self.written(path, result).await),
            Err(
                object_store::Error::AlreadyExists { .. }
                | object_store::Error::Precondition { .. }
                | object_store::Error::NotFound { .. },
            ) => Ok(WriteResult::PreconditionFailed {
                current_version: self.current_version(path).await,
            }),
            Err(e) => Err(map_err(path, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.store.delete(&self.location(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_err(path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // object_store lists by whole path segments; list the enclosing
        // directory and filter by the raw string prefix.
        let dir = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let dir_location = self.location(dir);
        let listing_root = if dir.is_empty() && self.root.is_empty() {
            None
        } else {
            Some(&dir_location)
        };

        let objects: Vec<object_store::ObjectMeta> = self
            .store
            .list(listing_root)
            .try_collect()
            .await
            .map_err(|e| map_err(prefix, e))?;

        Ok(objects
            .into_iter()
            .map(|meta| self.to_meta(meta))
            .filter(|meta| meta.path.starts_with(prefix) && !meta.path.starts_with(GUARD_DIR))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        match self.store.head(&self.location(path)).await {
            Ok(meta) => Ok(Some(self.to_meta(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_err(path, e)),
        }
    }
}
