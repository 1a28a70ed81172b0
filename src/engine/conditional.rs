//! First-committer-wins via guarded single-statement updates.

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Balance, ScopeId, Seat, SubjectId, UnitId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ConcurrencyStrategy;

/// Issues one conditional update per mutation and reads the row back only to
/// report results or classify a loss. Losers fail immediately; nothing ever
/// waits or retries.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionalStrategy;

impl ConditionalStrategy {
    /// Create the strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConcurrencyStrategy for ConditionalStrategy {
    fn name(&self) -> &'static str {
        "conditional"
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
        if store
            .try_reserve(scope_id, unit_id, holder_id, now, hold_deadline)
            .await?
        {
            return store
                .get_seat(scope_id, unit_id)
                .await?
                .ok_or_else(Error::seat_not_found);
        }
        // Zero rows affected: either the unit is unknown or someone else
        // holds it. Read back once to tell the two apart.
        match store.get_seat(scope_id, unit_id).await? {
            None => Err(Error::seat_not_found()),
            Some(_) => Err(Error::Conflict(format!("seat {unit_id} is not available"))),
        }
    }

    async fn confirm(
        &self,
        store: &dyn Store,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<Seat> {
        if store.try_confirm(scope_id, unit_id, holder_id).await? {
            return store
                .get_seat(scope_id, unit_id)
                .await?
                .ok_or_else(Error::seat_not_found);
        }
        match store.get_seat(scope_id, unit_id).await? {
            None => Err(Error::seat_not_found()),
            Some(_) => Err(Error::Conflict(format!(
                "seat {unit_id} is not reserved by this holder"
            ))),
        }
    }

    async fn deduct(
        &self,
        store: &dyn Store,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        if store.try_deduct(subject_id, amount, now).await? {
            return store
                .get_balance(subject_id)
                .await?
                .ok_or_else(|| Error::balance_not_found(subject_id));
        }
        match store.get_balance(subject_id).await? {
            None => Err(Error::balance_not_found(subject_id)),
            Some(balance) => Err(Error::InsufficientFunds {
                available: balance.amount,
                requested: amount,
            }),
        }
    }

    async fn credit(
        &self,
        store: &dyn Store,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        if store.try_credit(subject_id, amount, now).await? {
            return store
                .get_balance(subject_id)
                .await?
                .ok_or_else(|| Error::balance_not_found(subject_id));
        }
        Err(Error::balance_not_found(subject_id))
    }
}
