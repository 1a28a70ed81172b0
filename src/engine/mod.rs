//! Reservation and balance operations behind interchangeable concurrency
//! strategies.
//!
//! A [`ConcurrencyStrategy`] decides how a mutation defends against
//! concurrent committers; the [`Engine`] wraps a strategy with validation,
//! the optional distributed lock, cache invalidation, the audit trail, and
//! metrics. All three strategies uphold the same invariants (no double
//! holds, no overdrafts); they differ in how losers find out:
//!
//! - [`ConditionalStrategy`]: one guarded update, losers fail fast.
//! - [`PessimisticStrategy`]: row locks, losers wait their turn.
//! - [`OptimisticStrategy`]: version checks with a bounded retry budget.

use crate::cache::ViewCache;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, LockGuard, balance_key, seat_key};
use crate::store::Store;
use crate::types::{
    Balance, BalanceEntry, BalanceEntryKind, BalanceView, ReservationView, ScopeId, Seat,
    SubjectId, UnitId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

mod conditional;
mod optimistic;
mod pessimistic;

pub use conditional::ConditionalStrategy;
pub use optimistic::OptimisticStrategy;
pub use pessimistic::PessimisticStrategy;

/// One way of defending a mutation against concurrent committers.
///
/// Implementations receive `now` from the engine so they never read the
/// system clock themselves.
#[async_trait]
pub trait ConcurrencyStrategy: Send + Sync {
    /// Strategy label for logs and metrics.
    fn name(&self) -> &'static str;

    /// Place a hold on an available unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown unit, [`Error::Conflict`]
    /// when the unit is already held, [`Error::BusyRetryExhausted`] when an
    /// optimistic attempt budget runs out, or [`Error::Storage`] on store
    /// failure.
    async fn reserve(
        &self,
        store: &dyn Store,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<Seat>;

    /// Convert the caller's hold into a sale.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`ConcurrencyStrategy::reserve`].
    async fn confirm(
        &self,
        store: &dyn Store,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<Seat>;

    /// Return a lapsed hold to the pool. The transition is the same guarded
    /// update under every strategy: it fires only while the unit is still in
    /// the expired-reserved state, so it can never claw back a sale.
    /// Returns whether a release happened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    async fn release_expired(
        &self,
        store: &dyn Store,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        store.try_release_expired(scope_id, unit_id, now).await
    }

    /// Remove funds, refusing overdrafts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown account,
    /// [`Error::InsufficientFunds`] when the balance cannot cover the
    /// amount, [`Error::BusyRetryExhausted`] when an optimistic attempt
    /// budget runs out, or [`Error::Storage`] on store failure.
    async fn deduct(
        &self,
        store: &dyn Store,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance>;

    /// Add funds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown account,
    /// [`Error::BusyRetryExhausted`] when an optimistic attempt budget runs
    /// out, or [`Error::Storage`] on store failure.
    async fn credit(
        &self,
        store: &dyn Store,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance>;
}

/// Facade over one store, one strategy, and the ambient services.
pub struct Engine {
    store: Arc<dyn Store>,
    strategy: Arc<dyn ConcurrencyStrategy>,
    lock: Option<DistributedLock>,
    cache: Arc<ViewCache>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    /// Assemble an engine without a distributed lock; the strategy's own
    /// guard is the only defense.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        strategy: Arc<dyn ConcurrencyStrategy>,
        cache: Arc<ViewCache>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            strategy,
            lock: None,
            cache,
            clock,
            config,
        }
    }

    /// Wrap mutations in the distributed lock as well. The lock narrows the
    /// conflict window; the strategy's guard still decides the winner.
    #[must_use]
    pub fn with_lock(mut self, lock: DistributedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    async fn acquire(&self, key: &str) -> Result<Option<LockGuard>> {
        match &self.lock {
            Some(lock) => Ok(Some(lock.acquire(key).await?)),
            None => Ok(None),
        }
    }

    async fn release_guard(guard: Option<LockGuard>) {
        if let Some(guard) = guard {
            guard.release().await;
        }
    }

    /// Add a fresh available unit to a scope's inventory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the unit already exists, or
    /// [`Error::Storage`] on store failure.
    pub async fn add_seat(&self, scope_id: ScopeId, unit_id: UnitId) -> Result<ReservationView> {
        let seat = Seat::available(scope_id, unit_id);
        self.store.insert_seat(&seat).await?;
        self.cache.invalidate_availability(&scope_id).await;
        Ok(seat.into())
    }

    /// Open a balance account with `initial` cents. A second call for the
    /// same subject leaves the existing account untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    pub async fn open_balance(&self, subject_id: SubjectId, initial: u64) -> Result<()> {
        self.store
            .create_if_absent(&subject_id, initial, self.clock.now())
            .await
    }

    /// Available units of a scope, served through the look-aside cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    pub async fn availability(&self, scope_id: &ScopeId) -> Result<Vec<ReservationView>> {
        let store = Arc::clone(&self.store);
        let scope = *scope_id;
        self.cache
            .availability(scope_id, move || async move {
                let seats = store.list_available(&scope).await?;
                Ok(seats.into_iter().map(ReservationView::from).collect())
            })
            .await
    }

    /// Place a hold on a unit for `holder_id`. The hold lapses after the
    /// configured TTL unless confirmed.
    ///
    /// # Errors
    ///
    /// See [`ConcurrencyStrategy::reserve`]; additionally
    /// [`Error::Timeout`] when the distributed lock cannot be acquired.
    pub async fn reserve(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<ReservationView> {
        let now = self.clock.now();
        let hold_deadline = now + chrono::Duration::seconds(self.config.hold_ttl_secs);

        let guard = self.acquire(&seat_key(scope_id, unit_id)).await?;
        let outcome = self
            .strategy
            .reserve(self.store.as_ref(), scope_id, unit_id, holder_id, now, hold_deadline)
            .await;
        Self::release_guard(guard).await;

        match outcome {
            Ok(seat) => {
                self.cache.invalidate_availability(scope_id).await;
                crate::metrics::record_reservation(self.strategy.name());
                tracing::info!(
                    scope_id = %scope_id,
                    unit_id = %unit_id,
                    holder_id = %holder_id,
                    strategy = self.strategy.name(),
                    "Unit reserved"
                );
                Ok(seat.into())
            }
            Err(err) => {
                if matches!(err, Error::Conflict(_)) {
                    crate::metrics::record_conflict("reserve");
                }
                Err(err)
            }
        }
    }

    /// Convert `holder_id`'s hold into a permanent sale.
    ///
    /// # Errors
    ///
    /// See [`ConcurrencyStrategy::confirm`]; additionally
    /// [`Error::Timeout`] when the distributed lock cannot be acquired.
    pub async fn confirm(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<ReservationView> {
        let guard = self.acquire(&seat_key(scope_id, unit_id)).await?;
        let outcome = self
            .strategy
            .confirm(self.store.as_ref(), scope_id, unit_id, holder_id)
            .await;
        Self::release_guard(guard).await;

        match outcome {
            Ok(seat) => {
                self.cache.invalidate_availability(scope_id).await;
                crate::metrics::record_confirmation(self.strategy.name());
                tracing::info!(
                    scope_id = %scope_id,
                    unit_id = %unit_id,
                    holder_id = %holder_id,
                    "Hold confirmed"
                );
                Ok(seat.into())
            }
            Err(err) => {
                if matches!(err, Error::Conflict(_)) {
                    crate::metrics::record_conflict("confirm");
                }
                Err(err)
            }
        }
    }

    /// Return the unit's lapsed hold to the pool, if it has one. Returns
    /// whether a release happened; a unit that is available, sold, or still
    /// inside its hold TTL is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the distributed lock cannot be
    /// acquired, or [`Error::Storage`] on store failure.
    pub async fn release(&self, scope_id: &ScopeId, unit_id: &UnitId) -> Result<bool> {
        let now = self.clock.now();

        let guard = self.acquire(&seat_key(scope_id, unit_id)).await?;
        let outcome = self
            .strategy
            .release_expired(self.store.as_ref(), scope_id, unit_id, now)
            .await;
        Self::release_guard(guard).await;

        let released = outcome?;
        if released {
            self.cache.invalidate_availability(scope_id).await;
            crate::metrics::record_hold_released();
            tracing::info!(scope_id = %scope_id, unit_id = %unit_id, "Lapsed hold released");
        }
        Ok(released)
    }

    /// Deduct `amount` cents from a subject's balance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a zero amount; otherwise see
    /// [`ConcurrencyStrategy::deduct`].
    pub async fn deduct(&self, subject_id: &SubjectId, amount: u64) -> Result<BalanceView> {
        if amount == 0 {
            return Err(Error::Validation("amount must be positive".to_string()));
        }
        let now = self.clock.now();

        let guard = self.acquire(&balance_key(subject_id)).await?;
        let outcome = self
            .strategy
            .deduct(self.store.as_ref(), subject_id, amount, now)
            .await;
        Self::release_guard(guard).await;

        let balance = outcome?;
        self.record_entry(&balance, BalanceEntryKind::Deduct, amount, now)
            .await;
        crate::metrics::record_deduction(self.strategy.name());
        tracing::info!(
            subject_id = %subject_id,
            amount,
            remaining = balance.amount,
            "Balance deducted"
        );
        Ok(balance.into())
    }

    /// Add `amount` cents to a subject's balance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a zero amount; otherwise see
    /// [`ConcurrencyStrategy::credit`].
    pub async fn credit(&self, subject_id: &SubjectId, amount: u64) -> Result<BalanceView> {
        if amount == 0 {
            return Err(Error::Validation("amount must be positive".to_string()));
        }
        let now = self.clock.now();

        let guard = self.acquire(&balance_key(subject_id)).await?;
        let outcome = self
            .strategy
            .credit(self.store.as_ref(), subject_id, amount, now)
            .await;
        Self::release_guard(guard).await;

        let balance = outcome?;
        self.record_entry(&balance, BalanceEntryKind::Credit, amount, now)
            .await;
        crate::metrics::record_credit(self.strategy.name());
        tracing::info!(
            subject_id = %subject_id,
            amount,
            total = balance.amount,
            "Balance credited"
        );
        Ok(balance.into())
    }

    /// Current balance for a subject.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown account, or
    /// [`Error::Storage`] on store failure.
    pub async fn balance(&self, subject_id: &SubjectId) -> Result<BalanceView> {
        let balance = self
            .store
            .get_balance(subject_id)
            .await?
            .ok_or_else(|| Error::balance_not_found(subject_id))?;
        Ok(balance.into())
    }

    /// Audit trail for a subject, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    pub async fn balance_entries(&self, subject_id: &SubjectId) -> Result<Vec<BalanceEntry>> {
        self.store.entries(subject_id).await
    }

    /// The audit line must not fail a mutation that already committed.
    async fn record_entry(
        &self,
        balance: &Balance,
        kind: BalanceEntryKind,
        amount: u64,
        now: DateTime<Utc>,
    ) {
        let entry = BalanceEntry {
            subject_id: balance.subject_id,
            kind,
            amount,
            balance_after: balance.amount,
            recorded_at: now,
        };
        if let Err(err) = self.store.append_entry(&entry).await {
            tracing::error!(
                subject_id = %balance.subject_id,
                error = %err,
                "Failed to append balance audit entry"
            );
        }
    }
}
