//! Recording, failure-injecting storage for tests.
//!
//! [`TracingMemoryBackend`] wraps a [`MemoryBackend`] and logs each call as
//! a [`StorageOp`] before delegating. Paths under an injected prefix fail with
//! a storage error instead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use strata_core::error::{Error, Result};
use strata_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// `get(path)`.
    Get {
        /// Object read.
        path: String,
    },
    /// `head(path)`.
    Head {
        /// Object inspected.
        path: String,
    },
    /// `put(path, ..)`.
    Put {
        /// Object written.
        path: String,
        /// Payload size.
        size: usize,
        /// Precondition sent with the put.
        precondition: WritePrecondition,
    },
    /// `delete(path)`.
    Delete {
        /// Object deleted.
        path: String,
    },
    /// `list(prefix)`.
    List {
        /// Prefix listed.
        prefix: String,
    },
}

impl StorageOp {
    /// Path (or prefix) the call addressed.
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path }
            | Self::Head { path }
            | Self::Put { path, .. }
            | Self::Delete { path } => path,
            Self::List { prefix } => prefix,
        }
    }
}

/// [`MemoryBackend`] with call recording, latency, and failure injection.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    log: Arc<Mutex<Vec<StorageOp>>>,
    failing: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty backend that sleeps `latency` before every call.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Calls recorded so far, in order.
    pub fn operations(&self) -> Vec<StorageOp> {
        self.log.lock().unwrap().clone()
    }

    /// Paths passed to `delete`, in order.
    pub fn deleted_paths(&self) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                StorageOp::Delete { path } => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Paths passed to `put`, in order.
    pub fn written_paths(&self) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                StorageOp::Put { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Forgets recorded calls.
    pub fn clear_operations(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Fails every call whose path starts with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.failing.lock().unwrap().push(prefix.into());
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Pins the modification time of a stored object; absent paths are ignored.
    pub fn set_last_modified(&self, path: &str, at: DateTime<Utc>) {
        self.inner.set_last_modified(path, at).ok();
    }

    /// Stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.inner.paths()
    }

    /// Stored paths under `prefix`, sorted.
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        self.paths()
            .into_iter()
            .filter(|p| p.starts_with(prefix))
            .collect()
    }

    async fn enter(&self, op: StorageOp) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let path = op.path();
        if self.failing.lock().unwrap().iter().any(|p| path.starts_with(p.as_str())) {
            return Err(Error::storage(format!("injected failure for path: {path}")));
        }
        self.log.lock().unwrap().push(op);
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.enter(StorageOp::Get {
            path: path.to_string(),
        })
        .await?;
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.enter(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        })
        .await?;
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.enter(StorageOp::Delete {
            path: path.to_string(),
        })
        .await?;
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.enter(StorageOp::List {
            prefix: prefix.to_string(),
        })
        .await?;
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.enter(StorageOp::Head {
            path: path.to_string(),
        })
        .await?;
        self.inner.head(path).await
    }
}
