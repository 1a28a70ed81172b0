//! Row-lock-first mutations: contenders queue instead of failing.

use crate::error::Result;
use crate::store::Store;
use crate::types::{Balance, ScopeId, Seat, SubjectId, UnitId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ConcurrencyStrategy;

/// Delegates to the store's `_locked` operations, which take a row lock
/// before deciding. A contender blocked behind the winner observes the
/// committed state once the lock frees and loses cleanly (conflict or
/// insufficient funds) rather than racing.
#[derive(Clone, Copy, Debug, Default)]
pub struct PessimisticStrategy;

impl PessimisticStrategy {
    /// Create the strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConcurrencyStrategy for PessimisticStrategy {
    fn name(&self) -> &'static str {
        "pessimistic"
    }

    async fn reserve(
        &self,
        store: &dyn Store,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<Seat> {
        store
            .reserve_locked(scope_id, unit_id, holder_id, now, hold_deadline)
            .await
    }

    async fn confirm(
        &self,
        store: &dyn Store,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<Seat> {
        store.confirm_locked(scope_id, unit_id, holder_id).await
    }

    async fn deduct(
        &self,
        store: &dyn Store,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        store.deduct_locked(subject_id, amount, now).await
    }

    async fn credit(
        &self,
        store: &dyn Store,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        store.credit_locked(subject_id, amount, now).await
    }
}
