//! Renewal timing and lease-loss behaviour of `LeaseLock`, on paused time.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use strata_core::lease::{LeaseGrant, LeaseRecord, LeaseStore, LeaseStoreError, ObjectLeaseStore};
use strata_core::lock::{LeaseLost, LockError, LockOptions, WaitPolicy};
use strata_core::{LeaseLock, MemoryBackend};

/// Wraps a real store, counting renewals and failing them on demand.
struct FlakyStore {
    inner: ObjectLeaseStore,
    renewals: AtomicU32,
    fail_renew: AtomicBool,
}

impl FlakyStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ObjectLeaseStore::new(Arc::new(MemoryBackend::new())),
            renewals: AtomicU32::new(0),
            fail_renew: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl LeaseStore for FlakyStore {
    async fn ensure_resource(&self, resource_id: &str) -> Result<(), LeaseStoreError> {
        self.inner.ensure_resource(resource_id).await
    }

    async fn acquire(
        &self,
        resource_id: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseStoreError> {
        self.inner.acquire(resource_id, holder, duration).await
    }

    async fn renew(
        &self,
        resource_id: &str,
        lease_id: &str,
        duration: Duration,
    ) -> Result<(), LeaseStoreError> {
        if self.fail_renew.load(Ordering::SeqCst) {
            return Err(LeaseStoreError::NotHeld {
                resource_id: resource_id.to_string(),
                lease_id: lease_id.to_string(),
                reason: "injected renewal failure".to_string(),
            });
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        self.inner.renew(resource_id, lease_id, duration).await
    }

    async fn release(&self, resource_id: &str, lease_id: &str) -> Result<(), LeaseStoreError> {
        self.inner.release(resource_id, lease_id).await
    }

    async fn inspect(&self, resource_id: &str) -> Result<Option<LeaseRecord>, LeaseStoreError> {
        self.inner.inspect(resource_id).await
    }
}

fn recording_lock(store: Arc<FlakyStore>) -> (LeaseLock, Arc<Mutex<Vec<LeaseLost>>>) {
    let lost: Arc<Mutex<Vec<LeaseLost>>> = Arc::default();
    let sink = Arc::clone(&lost);
    let lock = LeaseLock::new(store)
        .with_options(LockOptions {
            poll_interval: Duration::from_secs(1),
            max_jitter: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(60),
            release_join_timeout: Duration::from_secs(5),
        })
        .with_loss_handler(Arc::new(move |event: &LeaseLost| {
            sink.lock().unwrap().push(event.clone());
        }));
    (lock, lost)
}

#[tokio::test(start_paused = true)]
async fn held_lease_is_renewed_every_half_duration() {
    let store = FlakyStore::new();
    let (lock, lost) = recording_lock(Arc::clone(&store));

    let handle = lock
        .acquire("bronze_market_data", Duration::from_secs(10), WaitPolicy::NoWait)
        .await
        .expect("acquire");

    // Renewal period is 5s; holding for 21s allows at least floor(21 / 5) renewals.
    tokio::time::sleep(Duration::from_secs(21)).await;

    assert!(handle.renewals() >= 4, "renewals = {}", handle.renewals());
    assert!(store.renewals.load(Ordering::SeqCst) >= 4);
    assert!(handle.ensure_held().is_ok());
    assert!(lost.lock().unwrap().is_empty());

    handle.release().await;
}

#[tokio::test(start_paused = true)]
async fn one_second_floor_applies_to_short_leases() {
    let store = FlakyStore::new();
    let (lock, _lost) = recording_lock(Arc::clone(&store));

    let handle = lock
        .acquire("tiny", Duration::from_secs(1), WaitPolicy::NoWait)
        .await
        .expect("acquire");
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    assert_eq!(handle.renewals(), 3);
    handle.release().await;
}

#[tokio::test(start_paused = true)]
async fn renewal_failure_marks_handle_lost_and_invokes_handler() {
    let store = FlakyStore::new();
    let (lock, lost) = recording_lock(Arc::clone(&store));

    let handle = lock
        .acquire("silver_prices", Duration::from_secs(10), WaitPolicy::NoWait)
        .await
        .expect("acquire");

    store.fail_renew.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(handle.is_lost());
    let err = handle.ensure_held().expect_err("lease should be lost");
    assert!(matches!(err, LockError::LeaseLost { .. }));

    let events = lost.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].lock_name, "silver_prices");
    assert_eq!(events[0].resource_id, "locks/silver_prices.lease.json");
    assert!(events[0].error.contains("injected renewal failure"));

    // Renewal stops after the first failure.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(lost.lock().unwrap().len(), 1);

    handle.release().await;
}

#[tokio::test(start_paused = true)]
async fn release_stops_renewal() {
    let store = FlakyStore::new();
    let (lock, _lost) = recording_lock(Arc::clone(&store));

    let handle = lock
        .acquire("gold", Duration::from_secs(4), WaitPolicy::NoWait)
        .await
        .expect("acquire");
    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.release().await;

    let after_release = store.renewals.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(store.renewals.load(Ordering::SeqCst), after_release);

    let record = store
        .inspect("locks/gold.lease.json")
        .await
        .expect("inspect")
        .expect("record");
    assert!(!record.is_live());
}

#[tokio::test(start_paused = true)]
async fn forever_policy_waits_for_release() {
    let store = FlakyStore::new();
    let (lock, _lost) = recording_lock(Arc::clone(&store));

    let first = lock
        .acquire("platinum", Duration::from_secs(30), WaitPolicy::Forever)
        .await
        .expect("first");

    let waiter = {
        let lock = lock.clone();
        tokio::spawn(async move {
            lock.acquire("platinum", Duration::from_secs(30), WaitPolicy::Forever)
                .await
        })
    };

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!waiter.is_finished());

    first.release().await;
    let second = waiter.await.expect("join").expect("second acquire");
    assert_eq!(second.sequence(), 2);
    second.release().await;
}
