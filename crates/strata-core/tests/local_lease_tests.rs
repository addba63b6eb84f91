//! Leases over the local filesystem backend.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strata_core::lease::{LeaseStore, ObjectLeaseStore};
use strata_core::lock::{LeaseLost, WaitPolicy};
use strata_core::{LeaseLock, ObjectStoreBackend};

fn local_store(dir: &Path) -> Arc<dyn LeaseStore> {
    let backend = ObjectStoreBackend::from_url(&format!("file://{}", dir.display()))
        .expect("local backend");
    Arc::new(ObjectLeaseStore::new(Arc::new(backend)))
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("strata-lease-{}", ulid::Ulid::new()))
}

#[tokio::test]
async fn lock_is_acquired_renewed_and_released_on_local_disk() {
    let dir = scratch_dir();
    let lock = LeaseLock::new(local_store(&dir)).with_loss_handler(Arc::new(|_: &LeaseLost| {}));

    let handle = lock
        .acquire("bronze", Duration::from_secs(2), WaitPolicy::NoWait)
        .await
        .expect("acquire");
    assert_eq!(handle.sequence(), 1);

    let err = lock
        .acquire("bronze", Duration::from_secs(2), WaitPolicy::NoWait)
        .await
        .expect_err("held");
    assert!(err.is_contention());

    // Renewal runs every second for a two second lease.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(handle.renewals() >= 1);
    assert!(!handle.is_lost());
    handle.ensure_held().expect("still held");

    handle.release().await;
    let record = lock.inspect("bronze").await.expect("inspect").expect("record");
    assert!(!record.is_live());

    let again = lock
        .acquire("bronze", Duration::from_secs(2), WaitPolicy::NoWait)
        .await
        .expect("re-acquire");
    assert_eq!(again.sequence(), 2);
    again.release().await;
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn store_renew_and_release_use_versioned_writes_on_local_disk() {
    let dir = scratch_dir();
    let store = local_store(&dir);
    let resource = "locks/silver.lease.json";
    store.ensure_resource(resource).await.expect("ensure");

    let grant = store
        .acquire(resource, "job-a", Duration::from_secs(30))
        .await
        .expect("acquire");
    store
        .renew(resource, &grant.lease_id, Duration::from_secs(30))
        .await
        .expect("renew");
    assert!(
        store
            .renew(resource, "someone-else", Duration::from_secs(30))
            .await
            .is_err()
    );
    store
        .release(resource, &grant.lease_id)
        .await
        .expect("release");

    let record = store.inspect(resource).await.expect("inspect").expect("record");
    assert!(!record.is_live());
    assert_eq!(record.sequence, 1);
    std::fs::remove_dir_all(dir).ok();
}
