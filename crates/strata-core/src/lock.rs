//! Job-level mutual exclusion on top of a [`LeaseStore`].
//!
//! A job execution acquires a [`LeaseLock`] for its job name before touching
//! shared state. Acquisition follows a [`WaitPolicy`]; once held, a background
//! task renews the lease every `max(1s, duration / 2)`.
//!
//! # Lease loss
//!
//! If a renewal fails the process may no longer hold exclusivity. The handle is
//! marked lost and the configured [`LeaseLossHandler`] runs; the production
//! handler ([`terminate_process`]) exits the process immediately so no further
//! shared state is mutated.
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = LeaseLock::new(Arc::new(ObjectLeaseStore::new(storage)));
//! let handle = lock
//!     .acquire("bronze_market_data", Duration::from_secs(60), WaitPolicy::NoWait)
//!     .await?;
//! // ... critical section ...
//! handle.release().await;
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::Error;
use crate::lease::{LeaseGrant, LeaseStore, LeaseStoreError};
use crate::metrics;

/// Exit code used when a held lease cannot be renewed (`EX_SOFTWARE`).
pub const LEASE_LOST_EXIT_CODE: i32 = 70;

/// Default lease duration.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// How long to wait for an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Fail immediately if the lock is held.
    #[default]
    NoWait,
    /// Poll until the lock is free or the timeout elapses.
    Timeout(Duration),
    /// Poll until the lock is free.
    Forever,
}

impl FromStr for WaitPolicy {
    type Err = Error;

    /// Parses `nowait`, `forever`, or a number of seconds.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "nowait" | "no_wait" | "0" => Ok(Self::NoWait),
            "forever" | "wait" => Ok(Self::Forever),
            secs => secs
                .parse::<u64>()
                .map(|s| Self::Timeout(Duration::from_secs(s)))
                .map_err(|_| {
                    Error::InvalidInput(format!(
                        "wait policy must be nowait, forever, or seconds (got {value})"
                    ))
                }),
        }
    }
}

/// Lock acquisition failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock is held by someone else and the policy does not wait.
    ///
    /// This is a contention outcome, not a failure: another execution is
    /// already doing this work.
    #[error("lock {lock_name} is already held by {holder}")]
    AlreadyHeld {
        /// Lock that was contended.
        lock_name: String,
        /// Diagnostic description of the holder.
        holder: String,
    },

    /// The lock stayed held for the whole wait budget.
    #[error("timed out after {waited:?} waiting for lock {lock_name}")]
    Timeout {
        /// Lock that was contended.
        lock_name: String,
        /// How long we waited.
        waited: Duration,
    },

    /// The lease backing this handle could not be renewed.
    #[error("lease for lock {lock_name} was lost")]
    LeaseLost {
        /// Lock whose lease was lost.
        lock_name: String,
    },

    /// The lease backend failed.
    #[error("lock backend error: {0}")]
    Storage(#[from] Error),
}

impl LockError {
    /// Returns true for the "someone else is doing this work" outcome.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyHeld { .. })
    }
}

/// Details passed to a [`LeaseLossHandler`].
#[derive(Debug, Clone)]
pub struct LeaseLost {
    /// Lock whose lease was lost.
    pub lock_name: String,
    /// Resource path of the lease.
    pub resource_id: String,
    /// Lease id that failed to renew.
    pub lease_id: String,
    /// Renewal error, rendered.
    pub error: String,
}

/// Callback invoked from the renewal task when a renewal fails.
pub type LeaseLossHandler = Arc<dyn Fn(&LeaseLost) + Send + Sync>;

/// Production [`LeaseLossHandler`]: logs and exits the process.
pub fn terminate_process(lost: &LeaseLost) {
    tracing::error!(
        lock = %lost.lock_name,
        resource = %lost.resource_id,
        lease_id = %lost.lease_id,
        error = %lost.error,
        exit_code = LEASE_LOST_EXIT_CODE,
        "lease renewal failed; terminating to preserve exclusivity"
    );
    std::process::exit(LEASE_LOST_EXIT_CODE);
}

/// Tuning for acquisition and release.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Fixed delay between acquisition attempts.
    pub poll_interval: Duration,
    /// Upper bound of the random jitter added to each poll.
    pub max_jitter: Duration,
    /// How often to log while waiting.
    pub heartbeat_interval: Duration,
    /// Bounded wait for the renewal task to stop on release.
    pub release_join_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_jitter: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(60),
            release_join_timeout: Duration::from_secs(5),
        }
    }
}

/// Returns the lease resource path for a lock name.
#[must_use]
pub fn resource_id(lock_name: &str) -> String {
    format!("locks/{lock_name}.lease.json")
}

/// Returns the renewal period for a lease duration: `max(1s, duration / 2)`.
#[must_use]
pub fn renewal_interval(duration: Duration) -> Duration {
    Duration::from_secs((duration.as_secs() / 2).max(1))
}

/// Distributed lock keyed by name, backed by a [`LeaseStore`].
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn LeaseStore>,
    options: LockOptions,
    holder: String,
    on_lost: LeaseLossHandler,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("options", &self.options)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl LeaseLock {
    /// Creates a lock with default options and the terminating loss handler.
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            options: LockOptions::default(),
            holder: format!("pid-{}", std::process::id()),
            on_lost: Arc::new(terminate_process),
        }
    }

    /// Overrides acquisition and release tuning.
    #[must_use]
    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the diagnostic holder description recorded with the lease.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Replaces the lease loss handler.
    #[must_use]
    pub fn with_loss_handler(mut self, handler: LeaseLossHandler) -> Self {
        self.on_lost = handler;
        self
    }

    /// Acquires the lock and starts background renewal.
    ///
    /// # Errors
    ///
    /// - [`LockError::AlreadyHeld`] when held and the policy is `NoWait`
    /// - [`LockError::Timeout`] when the `Timeout` budget is exhausted
    /// - [`LockError::Storage`] on backend failure
    pub async fn acquire(
        &self,
        lock_name: &str,
        duration: Duration,
        wait: WaitPolicy,
    ) -> Result<LeaseHandle, LockError> {
        let resource = resource_id(lock_name);
        self.store
            .ensure_resource(&resource)
            .await
            .map_err(|e| store_error(lock_name, e))?;

        let started = Instant::now();
        let mut last_heartbeat = started;

        loop {
            match self.store.acquire(&resource, &self.holder, duration).await {
                Ok(grant) => {
                    metrics::record_lease_acquired(lock_name);
                    tracing::info!(
                        lock = lock_name,
                        lease_id = %grant.lease_id,
                        sequence = grant.sequence,
                        waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "lock acquired"
                    );
                    return Ok(self.start_renewal(lock_name, grant));
                }
                Err(LeaseStoreError::Conflict { holder, .. }) => {
                    metrics::record_lease_contention(lock_name);
                    let waited = started.elapsed();
                    let remaining = match wait {
                        WaitPolicy::NoWait => {
                            return Err(LockError::AlreadyHeld {
                                lock_name: lock_name.to_string(),
                                holder,
                            });
                        }
                        WaitPolicy::Timeout(limit) if waited >= limit => {
                            return Err(LockError::Timeout {
                                lock_name: lock_name.to_string(),
                                waited,
                            });
                        }
                        WaitPolicy::Timeout(limit) => Some(limit - waited),
                        WaitPolicy::Forever => None,
                    };

                    if last_heartbeat.elapsed() >= self.options.heartbeat_interval {
                        tracing::info!(
                            lock = lock_name,
                            holder = %holder,
                            waited_secs = waited.as_secs(),
                            "still waiting for lock"
                        );
                        last_heartbeat = Instant::now();
                    }

                    let mut delay = self.options.poll_interval + jitter(self.options.max_jitter);
                    if let Some(remaining) = remaining {
                        delay = delay.min(remaining);
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(store_error(lock_name, e)),
            }
        }
    }

    /// Reads the lease record for a lock name without acquiring it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    pub async fn inspect(
        &self,
        lock_name: &str,
    ) -> Result<Option<crate::lease::LeaseRecord>, LockError> {
        self.store
            .inspect(&resource_id(lock_name))
            .await
            .map_err(|e| store_error(lock_name, e))
    }

    fn start_renewal(&self, lock_name: &str, grant: LeaseGrant) -> LeaseHandle {
        let state = Arc::new(LeaseState::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let renewal = RenewalTask {
            store: Arc::clone(&self.store),
            lock_name: lock_name.to_string(),
            resource_id: grant.resource_id.clone(),
            lease_id: grant.lease_id.clone(),
            duration: grant.duration,
            state: Arc::clone(&state),
            on_lost: Arc::clone(&self.on_lost),
        };
        let task = tokio::spawn(renewal.run(stop_rx));

        LeaseHandle {
            store: Arc::clone(&self.store),
            lock_name: lock_name.to_string(),
            grant,
            state,
            stop_tx,
            task: Some(task),
            join_timeout: self.options.release_join_timeout,
            released: false,
        }
    }
}

fn store_error(lock_name: &str, err: LeaseStoreError) -> LockError {
    match err {
        LeaseStoreError::Conflict { holder, .. } => LockError::AlreadyHeld {
            lock_name: lock_name.to_string(),
            holder,
        },
        LeaseStoreError::NotHeld { .. } => LockError::LeaseLost {
            lock_name: lock_name.to_string(),
        },
        LeaseStoreError::Storage(e) => LockError::Storage(e),
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[derive(Debug, Default)]
struct LeaseState {
    lost: AtomicBool,
    renewals: AtomicU64,
}

struct RenewalTask {
    store: Arc<dyn LeaseStore>,
    lock_name: String,
    resource_id: String,
    lease_id: String,
    duration: Duration,
    state: Arc<LeaseState>,
    on_lost: LeaseLossHandler,
}

impl RenewalTask {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let period = renewal_interval(self.duration);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        tracing::debug!(lock = %self.lock_name, "renewal loop stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    match self.store.renew(&self.resource_id, &self.lease_id, self.duration).await {
                        Ok(()) => {
                            self.state.renewals.fetch_add(1, Ordering::SeqCst);
                            metrics::record_lease_renewed(&self.lock_name);
                            tracing::debug!(lock = %self.lock_name, "lease renewed");
                        }
                        Err(e) => {
                            self.state.lost.store(true, Ordering::SeqCst);
                            metrics::record_lease_lost(&self.lock_name);
                            let lost = LeaseLost {
                                lock_name: self.lock_name.clone(),
                                resource_id: self.resource_id.clone(),
                                lease_id: self.lease_id.clone(),
                                error: e.to_string(),
                            };
                            (self.on_lost)(&lost);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// A held lock. Renewal runs until [`LeaseHandle::release`] is called.
///
/// Dropping the handle without releasing stops renewal and releases the lease
/// in the background on a best-effort basis; otherwise the lease expires.
pub struct LeaseHandle {
    store: Arc<dyn LeaseStore>,
    lock_name: String,
    grant: LeaseGrant,
    state: Arc<LeaseState>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    join_timeout: Duration,
    released: bool,
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("lock_name", &self.lock_name)
            .field("lease_id", &self.grant.lease_id)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

impl LeaseHandle {
    /// Returns the lock name.
    #[must_use]
    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    /// Returns the lease id issued on acquire.
    #[must_use]
    pub fn lease_id(&self) -> &str {
        &self.grant.lease_id
    }

    /// Returns the lease resource path.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.grant.resource_id
    }

    /// Returns the acquisition sequence (fencing token).
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.grant.sequence
    }

    /// Returns when the lease was acquired.
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.grant.acquired_at
    }

    /// Returns the number of successful renewals so far.
    #[must_use]
    pub fn renewals(&self) -> u64 {
        self.state.renewals.load(Ordering::SeqCst)
    }

    /// Returns true once a renewal has failed.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.state.lost.load(Ordering::SeqCst)
    }

    /// Fails if the lease has been lost.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::LeaseLost`] after a failed renewal.
    pub fn ensure_held(&self) -> Result<(), LockError> {
        if self.is_lost() {
            return Err(LockError::LeaseLost {
                lock_name: self.lock_name.clone(),
            });
        }
        Ok(())
    }

    /// Stops renewal and releases the lease.
    ///
    /// Errors are logged, not returned: an unreleased lease expires on its own.
    pub async fn release(mut self) {
        self.released = true;
        let _ = self.stop_tx.send(true);

        if let Some(task) = self.task.take() {
            if tokio::time::timeout(self.join_timeout, task).await.is_err() {
                tracing::warn!(
                    lock = %self.lock_name,
                    "renewal task did not stop within {:?}",
                    self.join_timeout
                );
            }
        }

        if self.is_lost() {
            return;
        }

        match self
            .store
            .release(&self.grant.resource_id, &self.grant.lease_id)
            .await
        {
            Ok(()) => tracing::info!(lock = %self.lock_name, "lock released"),
            Err(e) => tracing::warn!(
                lock = %self.lock_name,
                error = %e,
                "lock release failed; lease will expire"
            ),
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let _ = self.stop_tx.send(true);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.is_lost() {
            return;
        }
        let store = Arc::clone(&self.store);
        let resource = self.grant.resource_id.clone();
        let lease_id = self.grant.lease_id.clone();
        runtime.spawn(async move {
            let _ = store.release(&resource, &lease_id).await;
        });
    }
}
