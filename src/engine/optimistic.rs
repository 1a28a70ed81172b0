//! Version-check mutations with a bounded retry budget.

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Balance, ScopeId, Seat, SeatStatus, SubjectId, UnitId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::ConcurrencyStrategy;

/// Reads the record, checks the business predicate locally, then writes
/// guarded by the version it read. A version mismatch means another writer
/// committed in between; the strategy backs off a fixed delay and rereads,
/// up to the attempt budget. Predicate failures (unit taken, funds short)
/// are reported immediately, because rereading cannot change them in the
/// caller's favor.
#[derive(Clone, Copy, Debug)]
pub struct OptimisticStrategy {
    max_attempts: u32,
    retry_delay: Duration,
}

impl OptimisticStrategy {
    /// Create the strategy with an attempt budget and a fixed inter-attempt
    /// delay.
    #[must_use]
    pub const fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            retry_delay,
        }
    }

    /// Create the strategy from the engine's configured attempt budget and
    /// retry delay.
    #[must_use]
    pub const fn from_config(config: &crate::config::EngineConfig) -> Self {
        Self::new(
            config.optimistic_max_attempts,
            Duration::from_millis(config.optimistic_retry_delay_ms),
        )
    }

    async fn back_off(&self, attempt: u32, what: &str) {
        tracing::debug!(attempt, what, "Version conflict, retrying");
        tokio::time::sleep(self.retry_delay).await;
    }
}

impl Default for OptimisticStrategy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

#[async_trait]
impl ConcurrencyStrategy for OptimisticStrategy {
    fn name(&self) -> &'static str {
        "optimistic"
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
        for attempt in 1..=self.max_attempts {
            let seat = store
                .get_seat(scope_id, unit_id)
                .await?
                .ok_or_else(Error::seat_not_found)?;
            if seat.status != SeatStatus::Available {
                return Err(Error::Conflict(format!("seat {unit_id} is not available")));
            }
            if store
                .try_reserve_versioned(
                    scope_id,
                    unit_id,
                    holder_id,
                    seat.version,
                    now,
                    hold_deadline,
                )
                .await?
            {
                return store
                    .get_seat(scope_id, unit_id)
                    .await?
                    .ok_or_else(Error::seat_not_found);
            }
            if attempt < self.max_attempts {
                self.back_off(attempt, "reserve").await;
            }
        }
        Err(Error::BusyRetryExhausted {
            attempts: self.max_attempts,
        })
    }

    async fn confirm(
        &self,
        store: &dyn Store,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<Seat> {
        for attempt in 1..=self.max_attempts {
            let seat = store
                .get_seat(scope_id, unit_id)
                .await?
                .ok_or_else(Error::seat_not_found)?;
            if seat.status != SeatStatus::Reserved || seat.holder_id != Some(*holder_id) {
                return Err(Error::Conflict(format!(
                    "seat {unit_id} is not reserved by this holder"
                )));
            }
            if store
                .try_confirm_versioned(scope_id, unit_id, holder_id, seat.version)
                .await?
            {
                return store
                    .get_seat(scope_id, unit_id)
                    .await?
                    .ok_or_else(Error::seat_not_found);
            }
            if attempt < self.max_attempts {
                self.back_off(attempt, "confirm").await;
            }
        }
        Err(Error::BusyRetryExhausted {
            attempts: self.max_attempts,
        })
    }

    async fn deduct(
        &self,
        store: &dyn Store,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        for attempt in 1..=self.max_attempts {
            let balance = store
                .get_balance(subject_id)
                .await?
                .ok_or_else(|| Error::balance_not_found(subject_id))?;
            if !balance.can_deduct(amount) {
                return Err(Error::InsufficientFunds {
                    available: balance.amount,
                    requested: amount,
                });
            }
            if store
                .try_deduct_versioned(subject_id, amount, balance.version, now)
                .await?
            {
                return store
                    .get_balance(subject_id)
                    .await?
                    .ok_or_else(|| Error::balance_not_found(subject_id));
            }
            if attempt < self.max_attempts {
                self.back_off(attempt, "deduct").await;
            }
        }
        Err(Error::BusyRetryExhausted {
            attempts: self.max_attempts,
        })
    }

    async fn credit(
        &self,
        store: &dyn Store,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        for attempt in 1..=self.max_attempts {
            let balance = store
                .get_balance(subject_id)
                .await?
                .ok_or_else(|| Error::balance_not_found(subject_id))?;
            if store
                .try_credit_versioned(subject_id, amount, balance.version, now)
                .await?
            {
                return store
                    .get_balance(subject_id)
                    .await?
                    .ok_or_else(|| Error::balance_not_found(subject_id));
            }
            if attempt < self.max_attempts {
                self.back_off(attempt, "credit").await;
            }
        }
        Err(Error::BusyRetryExhausted {
            attempts: self.max_attempts,
        })
    }
}
