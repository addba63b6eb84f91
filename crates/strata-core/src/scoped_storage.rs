//! Tenant scoped storage.
//!
//! [`ScopedStorage`] wraps any [`StorageBackend`] and prefixes every path with
//! `tenant={tenant}/`. Components receive a `ScopedStorage` (or any other
//! backend) and work with tenant-relative paths; they cannot address another
//! tenant's objects.
//!
//! Paths must stay relative: no leading `/`, no `.` or `..` segments.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
use crate::tenant::TenantId;

/// A [`StorageBackend`] confined to one tenant's prefix.
#[derive(Clone)]
pub struct ScopedStorage {
    backend: Arc<dyn StorageBackend>,
    tenant: TenantId,
    prefix: String,
}

impl std::fmt::Debug for ScopedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStorage")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl ScopedStorage {
    /// Scopes `backend` to `tenant`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, tenant: TenantId) -> Self {
        let prefix = tenant.storage_prefix();
        Self {
            backend,
            tenant,
            prefix,
        }
    }

    /// Owning tenant.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// The unscoped backend underneath.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Rejects paths that could leave the tenant prefix.
    fn check_relative(path: &str) -> Result<()> {
        let problem = if path.starts_with('/') {
            Some("is absolute")
        } else if path.chars().any(|c| c == '\\' || c.is_control()) {
            Some("contains a backslash or control character")
        } else if path.split('/').any(|segment| matches!(segment, "." | "..")) {
            Some("contains a relative segment")
        } else {
            None
        };
        match problem {
            Some(problem) => Err(Error::InvalidInput(format!("path '{path}' {problem}"))),
            None => Ok(()),
        }
    }

    fn scoped(&self, path: &str) -> Result<String> {
        Self::check_relative(path)?;
        Ok(format!("{}{path}", self.prefix))
    }

    fn unscoped(&self, mut meta: ObjectMeta) -> ObjectMeta {
        if let Some(relative) = meta.path.strip_prefix(&self.prefix) {
            meta.path = relative.to_string();
        }
        meta
    }
}

#[async_trait]
impl StorageBackend for ScopedStorage {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.backend.get(&self.scoped(path)?).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.backend
            .put(&self.scoped(path)?, data, precondition)
            .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.backend.delete(&self.scoped(path)?).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.backend.list(&self.scoped(prefix)?).await?;
        Ok(objects.into_iter().map(|m| self.unscoped(m)).collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let meta = self.backend.head(&self.scoped(path)?).await?;
        Ok(meta.map(|m| self.unscoped(m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn scoped(backend: &MemoryBackend, tenant: &str) -> ScopedStorage {
        ScopedStorage::new(
            Arc::new(backend.clone()),
            TenantId::new(tenant).expect("tenant"),
        )
    }

    #[tokio::test]
    async fn paths_are_prefixed_and_listings_relative() {
        let backend = MemoryBackend::new();
        let acme = scoped(&backend, "acme");

        acme.put("silver/AAPL/x", Bytes::from("1"), WritePrecondition::None)
            .await
            .expect("put");

        assert_eq!(backend.paths(), vec!["tenant=acme/silver/AAPL/x"]);
        let listed = acme.list("silver/").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "silver/AAPL/x");
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let backend = MemoryBackend::new();
        let acme = scoped(&backend, "acme");
        let globex = scoped(&backend, "globex");

        acme.put("state/a.json", Bytes::from("1"), WritePrecondition::None)
            .await
            .expect("put");

        assert!(globex.head("state/a.json").await.expect("head").is_none());
        assert!(globex.list("").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let backend = MemoryBackend::new();
        let acme = scoped(&backend, "acme");
        assert!(acme.get("../tenant=globex/x").await.is_err());
        assert!(acme.get("/abs").await.is_err());
        assert!(acme.put("a\\b", Bytes::new(), WritePrecondition::None).await.is_err());
        assert!(acme.list("silver/./x").await.is_err());
    }
}
