//! Cross-process mutual exclusion with lease renewal.
//!
//! The lock is a lease in the shared key-value store: acquisition is a
//! set-if-absent with a TTL, release is a compare-and-delete scoped to the
//! owner value. While a [`LockGuard`] is alive, a background watchdog renews
//! the lease so a slow-but-alive holder is not preempted; if the holder
//! crashes, renewal stops and the lease lapses naturally, bounding the
//! staleness window to one lease interval.
//!
//! Guarantee: at most one live holder per key. There is **no** fairness or
//! FIFO ordering among waiting acquirers; contenders poll and whoever lands
//! on a free lease first wins.
//!
//! The lock is an optimization aid, never the correctness backstop: the
//! record store's own conditional updates remain the final arbiter even if
//! the lock is bypassed or its lease lapses mid-section.

use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::types::{ScopeId, SubjectId, UnitId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lock key for one seat: unrelated units never contend.
#[must_use]
pub fn seat_key(scope_id: &ScopeId, unit_id: &UnitId) -> String {
    format!("seat:reservation:{scope_id}:{unit_id}")
}

/// Lock key for one subject's balance. Deduct and credit share the key so
/// they serialize against each other.
#[must_use]
pub fn balance_key(subject_id: &SubjectId) -> String {
    format!("balance:operation:{subject_id}")
}

/// Distributed lock manager over a shared key-value store.
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
}

impl DistributedLock {
    /// Create a lock manager with the given backing store and timings.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Acquire `key` using the configured wait and lease timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the wait deadline elapses before the
    /// lease frees up, or [`Error::Storage`] on store failure.
    pub async fn acquire(&self, key: &str) -> Result<LockGuard> {
        self.acquire_with(
            key,
            Duration::from_millis(self.config.wait_timeout_ms),
            Duration::from_millis(self.config.lease_ms),
        )
        .await
    }

    /// Acquire `key` with explicit timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the wait deadline elapses before the
    /// lease frees up, or [`Error::Storage`] on store failure.
    pub async fn acquire_with(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease: Duration,
    ) -> Result<LockGuard> {
        let owner = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + wait_timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            if self.store.set_if_absent(key, &owner, lease).await? {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                crate::metrics::record_lock_timeout();
                tracing::warn!(key, ?wait_timeout, "Failed to acquire lock");
                return Err(Error::Timeout(format!(
                    "lock {key} not acquired within {wait_timeout:?}"
                )));
            }
            tokio::time::sleep(poll).await;
        }

        tracing::debug!(key, "Lock acquired");

        let watchdog = spawn_watchdog(
            Arc::clone(&self.store),
            key.to_string(),
            owner.clone(),
            lease,
            Duration::from_millis(self.config.slow_section_warn_ms),
        );

        Ok(LockGuard {
            key: key.to_string(),
            owner,
            store: Arc::clone(&self.store),
            watchdog: Some(watchdog),
            released: false,
        })
    }
}

/// Periodically extend the lease while the guard is alive, and warn once if
/// the protected section runs longer than the configured threshold.
fn spawn_watchdog(
    store: Arc<dyn KeyValueStore>,
    key: String,
    owner: String,
    lease: Duration,
    slow_warn: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let renew_every = (lease / 3).max(Duration::from_millis(10));
        let started = tokio::time::Instant::now();
        let mut warned_slow = false;

        loop {
            tokio::time::sleep(renew_every).await;

            if !warned_slow && started.elapsed() >= slow_warn {
                tracing::warn!(
                    key,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Critical section exceeded the slow-section threshold"
                );
                warned_slow = true;
            }

            match store.extend_if_matches(&key, &owner, lease).await {
                Ok(true) => tracing::trace!(key, "Lease renewed"),
                Ok(false) => {
                    // The lease lapsed or someone else took over; nothing
                    // left to renew.
                    tracing::warn!(key, "Lease no longer held, stopping renewal");
                    return;
                }
                Err(err) => {
                    tracing::warn!(key, error = %err, "Lease renewal failed, will retry");
                }
            }
        }
    })
}

/// Ownership of one acquired lease.
///
/// Prefer [`LockGuard::release`]; dropping the guard stops the watchdog and
/// issues a best-effort asynchronous release, and the lease TTL covers the
/// remaining failure modes.
pub struct LockGuard {
    key: String,
    owner: String,
    store: Arc<dyn KeyValueStore>,
    watchdog: Option<JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lease. Idempotent: releasing a lease that has already
    /// lapsed (and possibly been re-acquired by someone else) is a no-op.
    pub async fn release(mut self) {
        self.stop_watchdog();
        self.released = true;
        match self.store.delete_if_matches(&self.key, &self.owner).await {
            Ok(true) => tracing::debug!(key = %self.key, "Lock released"),
            Ok(false) => {
                tracing::debug!(key = %self.key, "Lock already lapsed before release");
            }
            Err(err) => {
                // The TTL will reclaim the lease.
                tracing::warn!(key = %self.key, error = %err, "Lock release failed");
            }
        }
    }

    fn stop_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_watchdog();
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = store.delete_if_matches(&key, &owner).await {
                    tracing::warn!(key, error = %err, "Best-effort lock release failed");
                }
            });
        }
        // Outside a runtime the lease TTL reclaims the lock.
    }
}
