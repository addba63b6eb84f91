//! Lease primitive over object storage.
//!
//! A lease is a time-bounded exclusive claim on a named resource. The
//! [`LeaseStore`] trait is the backend contract (acquire / renew / release on a
//! named object); [`ObjectLeaseStore`] implements it on any [`StorageBackend`]
//! using conditional writes:
//!
//! 1. The resource is a small JSON lease record, created idempotently with a
//!    `DoesNotExist` precondition.
//! 2. Acquisition reads the record and its version; a free or expired record is
//!    replaced with a `MatchesVersion` write, so exactly one contender wins.
//! 3. Renewal and release must present the current `lease_id`; a stale id (the
//!    lease expired and someone else took it) is rejected.
//!
//! At most one live `lease_id` exists per resource at any instant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::Error;
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Errors reported by a [`LeaseStore`].
#[derive(Debug, thiserror::Error)]
pub enum LeaseStoreError {
    /// Another holder owns a live lease on the resource.
    #[error("lease on {resource_id} is held by {holder}")]
    Conflict {
        /// Resource that was contended.
        resource_id: String,
        /// Diagnostic description of the current holder.
        holder: String,
    },

    /// The presented lease id is no longer current.
    #[error("lease {lease_id} on {resource_id} is not held: {reason}")]
    NotHeld {
        /// Resource the lease was for.
        resource_id: String,
        /// Lease id that was presented.
        lease_id: String,
        /// Why the lease is no longer valid.
        reason: String,
    },

    /// The backend failed.
    #[error(transparent)]
    Storage(#[from] Error),
}

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Resource the lease covers.
    pub resource_id: String,
    /// Opaque token issued on acquire; required to renew and release.
    pub lease_id: String,
    /// Lease duration.
    pub duration: Duration,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
    /// Monotonic acquisition counter for the resource (fencing token).
    pub sequence: u64,
}

/// Lease record persisted at the resource path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Current lease id; `None` when the resource is free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    /// Diagnostic holder description (host, job execution).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    /// When the current lease expires.
    pub expires_at: DateTime<Utc>,
    /// When the current lease was acquired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
    /// Number of acquisitions so far.
    #[serde(default)]
    pub sequence: u64,
}

impl LeaseRecord {
    fn free(sequence: u64) -> Self {
        Self {
            lease_id: None,
            holder: None,
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
            acquired_at: None,
            sequence,
        }
    }

    /// Returns true if a live lease is recorded.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.lease_id.is_some() && Utc::now() < self.expires_at
    }
}

/// Backend contract for leases on named resources.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Creates the backing resource if it does not exist (idempotent).
    async fn ensure_resource(&self, resource_id: &str) -> Result<(), LeaseStoreError>;

    /// Takes a lease, failing with [`LeaseStoreError::Conflict`] if it is held.
    async fn acquire(
        &self,
        resource_id: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseStoreError>;

    /// Extends a held lease by `duration` from now.
    async fn renew(
        &self,
        resource_id: &str,
        lease_id: &str,
        duration: Duration,
    ) -> Result<(), LeaseStoreError>;

    /// Releases a held lease.
    async fn release(&self, resource_id: &str, lease_id: &str) -> Result<(), LeaseStoreError>;

    /// Reads the current lease record without modifying it.
    async fn inspect(&self, resource_id: &str) -> Result<Option<LeaseRecord>, LeaseStoreError>;
}

/// [`LeaseStore`] backed by conditional writes on a [`StorageBackend`].
pub struct ObjectLeaseStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for ObjectLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLeaseStore").finish_non_exhaustive()
    }
}

impl ObjectLeaseStore {
    /// Creates a lease store over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Reads the record together with the version it was read at.
    ///
    /// The version is taken from HEAD before the body is read, so a
    /// concurrent writer makes the subsequent CAS fail rather than succeed
    /// against content we never saw.
    async fn read(
        &self,
        resource_id: &str,
    ) -> Result<Option<(ObjectMeta, LeaseRecord)>, LeaseStoreError> {
        let Some(meta) = self.storage.head(resource_id).await? else {
            return Ok(None);
        };
        match self.storage.get(resource_id).await {
            Ok(data) => {
                let record: LeaseRecord = serde_json::from_slice(&data).map_err(|e| {
                    Error::serialization(format!("parse lease {resource_id}: {e}"))
                })?;
                Ok(Some((meta, record)))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(
        &self,
        resource_id: &str,
        record: &LeaseRecord,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, LeaseStoreError> {
        let body = serde_json::to_vec(record)
            .map_err(|e| Error::serialization(format!("serialize lease: {e}")))?;
        Ok(self
            .storage
            .put(resource_id, Bytes::from(body), precondition)
            .await?)
    }
}

fn expiry(duration: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::seconds(60))
}

#[async_trait]
impl LeaseStore for ObjectLeaseStore {
    async fn ensure_resource(&self, resource_id: &str) -> Result<(), LeaseStoreError> {
        // PreconditionFailed means the resource already exists.
        self.write(
            resource_id,
            &LeaseRecord::free(0),
            WritePrecondition::DoesNotExist,
        )
        .await?;
        Ok(())
    }

    async fn acquire(
        &self,
        resource_id: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseStoreError> {
        let Some((meta, current)) = self.read(resource_id).await? else {
            return Err(LeaseStoreError::Conflict {
                resource_id: resource_id.to_string(),
                holder: "resource missing".to_string(),
            });
        };

        if current.is_live() {
            return Err(LeaseStoreError::Conflict {
                resource_id: resource_id.to_string(),
                holder: current
                    .holder
                    .or(current.lease_id)
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        let acquired_at = Utc::now();
        let sequence = current.sequence.saturating_add(1);
        let lease_id = Ulid::new().to_string();
        let record = LeaseRecord {
            lease_id: Some(lease_id.clone()),
            holder: Some(holder.to_string()),
            expires_at: expiry(duration),
            acquired_at: Some(acquired_at),
            sequence,
        };

        match self
            .write(
                resource_id,
                &record,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(LeaseGrant {
                resource_id: resource_id.to_string(),
                lease_id,
                duration,
                acquired_at,
                sequence,
            }),
            WriteResult::PreconditionFailed { .. } => Err(LeaseStoreError::Conflict {
                resource_id: resource_id.to_string(),
                holder: "concurrent acquirer".to_string(),
            }),
        }
    }

    async fn renew(
        &self,
        resource_id: &str,
        lease_id: &str,
        duration: Duration,
    ) -> Result<(), LeaseStoreError> {
        let not_held = |reason: &str| LeaseStoreError::NotHeld {
            resource_id: resource_id.to_string(),
            lease_id: lease_id.to_string(),
            reason: reason.to_string(),
        };

        let Some((meta, current)) = self.read(resource_id).await? else {
            return Err(not_held("lease resource deleted"));
        };
        if current.lease_id.as_deref() != Some(lease_id) {
            return Err(not_held("lease taken over or released"));
        }

        let record = LeaseRecord {
            expires_at: expiry(duration),
            ..current
        };
        match self
            .write(
                resource_id,
                &record,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => {
                Err(not_held("lease record modified concurrently"))
            }
        }
    }

    async fn release(&self, resource_id: &str, lease_id: &str) -> Result<(), LeaseStoreError> {
        let not_held = |reason: &str| LeaseStoreError::NotHeld {
            resource_id: resource_id.to_string(),
            lease_id: lease_id.to_string(),
            reason: reason.to_string(),
        };

        let Some((meta, current)) = self.read(resource_id).await? else {
            return Ok(());
        };
        if current.lease_id.as_deref() != Some(lease_id) {
            return Err(not_held("lease held by another holder"));
        }

        // Leave a free record in place (keeping the sequence) instead of
        // deleting: a delete could race with the next holder's create.
        match self
            .write(
                resource_id,
                &LeaseRecord::free(current.sequence),
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => {
                Err(not_held("lease record modified concurrently"))
            }
        }
    }

    async fn inspect(&self, resource_id: &str) -> Result<Option<LeaseRecord>, LeaseStoreError> {
        Ok(self.read(resource_id).await?.map(|(_, record)| record))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::Result as StorageResult;
    use crate::storage::MemoryBackend;

    const RESOURCE: &str = "locks/test.lease.json";

    fn store() -> (MemoryBackend, ObjectLeaseStore) {
        let backend = MemoryBackend::new();
        let store = ObjectLeaseStore::new(Arc::new(backend.clone()));
        (backend, store)
    }

    #[tokio::test]
    async fn ensure_resource_is_idempotent() {
        let (backend, store) = store();
        store.ensure_resource(RESOURCE).await.expect("ensure");
        store.ensure_resource(RESOURCE).await.expect("ensure again");
        assert_eq!(backend.paths(), vec![RESOURCE]);
        let record = store.inspect(RESOURCE).await.expect("inspect").expect("exists");
        assert!(!record.is_live());
    }

    #[tokio::test]
    async fn second_acquire_conflicts() {
        let (_, store) = store();
        store.ensure_resource(RESOURCE).await.expect("ensure");
        let grant = store
            .acquire(RESOURCE, "job-a", Duration::from_secs(30))
            .await
            .expect("acquire");
        assert_eq!(grant.sequence, 1);

        let err = store
            .acquire(RESOURCE, "job-b", Duration::from_secs(30))
            .await
            .expect_err("held");
        assert!(matches!(err, LeaseStoreError::Conflict { ref holder, .. } if holder == "job-a"));
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over_and_old_id_cannot_renew() {
        let (_, store) = store();
        store.ensure_resource(RESOURCE).await.expect("ensure");
        let first = store
            .acquire(RESOURCE, "job-a", Duration::from_millis(1))
            .await
            .expect("acquire");

        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = store
            .acquire(RESOURCE, "job-b", Duration::from_secs(30))
            .await
            .expect("takeover");
        assert_eq!(second.sequence, 2);

        let err = store
            .renew(RESOURCE, &first.lease_id, Duration::from_secs(30))
            .await
            .expect_err("stale lease id");
        assert!(matches!(err, LeaseStoreError::NotHeld { .. }));
        store
            .renew(RESOURCE, &second.lease_id, Duration::from_secs(30))
            .await
            .expect("current holder renews");
    }

    #[tokio::test]
    async fn release_frees_resource_and_keeps_sequence() {
        let (_, store) = store();
        store.ensure_resource(RESOURCE).await.expect("ensure");
        let grant = store
            .acquire(RESOURCE, "job-a", Duration::from_secs(30))
            .await
            .expect("acquire");
        store
            .release(RESOURCE, &grant.lease_id)
            .await
            .expect("release");

        let next = store
            .acquire(RESOURCE, "job-b", Duration::from_secs(30))
            .await
            .expect("re-acquire");
        assert_eq!(next.sequence, 2);

        let err = store
            .release(RESOURCE, &grant.lease_id)
            .await
            .expect_err("not ours anymore");
        assert!(matches!(err, LeaseStoreError::NotHeld { .. }));
    }

    /// Memory storage that lets another writer slip in right before the next
    /// conditional put.
    #[derive(Default)]
    struct InterleavingBackend {
        inner: MemoryBackend,
        interleave: AtomicBool,
    }

    #[async_trait]
    impl StorageBackend for InterleavingBackend {
        async fn get(&self, path: &str) -> StorageResult<Bytes> {
            self.inner.get(path).await
        }

        async fn put(
            &self,
            path: &str,
            data: Bytes,
            precondition: WritePrecondition,
        ) -> StorageResult<WriteResult> {
            let conditional = matches!(precondition, WritePrecondition::MatchesVersion(_));
            if conditional && self.interleave.swap(false, Ordering::SeqCst) {
                let takeover = LeaseRecord {
                    lease_id: Some("intruder".to_string()),
                    holder: Some("job-b".to_string()),
                    ..LeaseRecord::free(7)
                };
                let body = serde_json::to_vec(&takeover).expect("serialize");
                self.inner
                    .put(path, Bytes::from(body), WritePrecondition::None)
                    .await?;
            }
            self.inner.put(path, data, precondition).await
        }

        async fn delete(&self, path: &str) -> StorageResult<()> {
            self.inner.delete(path).await
        }

        async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
            self.inner.list(prefix).await
        }

        async fn head(&self, path: &str) -> StorageResult<Option<ObjectMeta>> {
            self.inner.head(path).await
        }
    }

    #[tokio::test]
    async fn release_after_concurrent_takeover_is_not_held() {
        let backend = Arc::new(InterleavingBackend::default());
        let store = ObjectLeaseStore::new(Arc::clone(&backend) as Arc<dyn StorageBackend>);
        store.ensure_resource(RESOURCE).await.expect("ensure");
        let grant = store
            .acquire(RESOURCE, "job-a", Duration::from_secs(30))
            .await
            .expect("acquire");

        backend.interleave.store(true, Ordering::SeqCst);
        let err = store
            .release(RESOURCE, &grant.lease_id)
            .await
            .expect_err("record changed under us");
        assert!(matches!(err, LeaseStoreError::NotHeld { .. }));

        let record = store.inspect(RESOURCE).await.expect("inspect").expect("exists");
        assert_eq!(record.lease_id.as_deref(), Some("intruder"));
    }

    #[tokio::test]
    async fn acquire_without_resource_is_conflict() {
        let (_, store) = store();
        let err = store
            .acquire(RESOURCE, "job-a", Duration::from_secs(30))
            .await
            .expect_err("missing resource");
        assert!(matches!(err, LeaseStoreError::Conflict { .. }));
    }
}
