//! In-memory store for tests and local development.
//!
//! All three record families live behind one mutex, so every operation is
//! linearizable and the conditional-update contracts hold trivially. Time is
//! never read here; callers pass `now` in, which keeps tests deterministic.

use crate::error::{Error, Result};
use crate::types::{
    Balance, BalanceEntry, QueueToken, ScopeId, Seat, SeatStatus, SubjectId, TokenId,
    TokenStatus, UnitId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{BalanceStore, SeatStore, TokenStore};

#[derive(Default)]
struct State {
    seats: HashMap<(ScopeId, UnitId), Seat>,
    balances: HashMap<SubjectId, Balance>,
    balance_entries: HashMap<SubjectId, Vec<BalanceEntry>>,
    tokens: HashMap<TokenId, QueueToken>,
}

/// Mutex-backed implementation of all three store contracts.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn count_active_in(state: &State, scope_id: &ScopeId) -> u64 {
    state
        .tokens
        .values()
        .filter(|t| t.scope_id == *scope_id && t.status == TokenStatus::Active)
        .count() as u64
}

#[allow(clippy::cast_possible_truncation)] // record counts stay far below u64::MAX
#[async_trait]
impl SeatStore for MemoryStore {
    async fn insert_seat(&self, seat: &Seat) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (seat.scope_id, seat.unit_id);
        if state.seats.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "seat {}/{} already exists",
                seat.scope_id, seat.unit_id
            )));
        }
        state.seats.insert(key, seat.clone());
        Ok(())
    }

    async fn get_seat(&self, scope_id: &ScopeId, unit_id: &UnitId) -> Result<Option<Seat>> {
        let state = self.state.lock().await;
        Ok(state.seats.get(&(*scope_id, *unit_id)).cloned())
    }

    async fn list_available(&self, scope_id: &ScopeId) -> Result<Vec<Seat>> {
        let state = self.state.lock().await;
        let mut seats: Vec<Seat> = state
            .seats
            .values()
            .filter(|s| s.scope_id == *scope_id && s.status == SeatStatus::Available)
            .cloned()
            .collect();
        seats.sort_by_key(|s| s.unit_id);
        Ok(seats)
    }

    async fn try_reserve(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(seat) = state.seats.get_mut(&(*scope_id, *unit_id)) else {
            return Ok(false);
        };
        if seat.status != SeatStatus::Available {
            return Ok(false);
        }
        seat.status = SeatStatus::Reserved;
        seat.holder_id = Some(*holder_id);
        seat.reserved_at = Some(now);
        seat.expires_at = Some(hold_deadline);
        seat.version += 1;
        Ok(true)
    }

    async fn try_confirm(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(seat) = state.seats.get_mut(&(*scope_id, *unit_id)) else {
            return Ok(false);
        };
        if seat.status != SeatStatus::Reserved || seat.holder_id != Some(*holder_id) {
            return Ok(false);
        }
        seat.status = SeatStatus::Sold;
        seat.expires_at = None;
        seat.version += 1;
        Ok(true)
    }

    async fn try_release_expired(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(seat) = state.seats.get_mut(&(*scope_id, *unit_id)) else {
            return Ok(false);
        };
        let lapsed = seat.status == SeatStatus::Reserved
            && seat.expires_at.is_some_and(|deadline| deadline <= cutoff);
        if !lapsed {
            return Ok(false);
        }
        seat.status = SeatStatus::Available;
        seat.holder_id = None;
        seat.reserved_at = None;
        seat.expires_at = None;
        seat.version += 1;
        Ok(true)
    }

    async fn try_reserve_versioned(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        expected_version: i64,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(seat) = state.seats.get_mut(&(*scope_id, *unit_id)) else {
            return Ok(false);
        };
        if seat.version != expected_version || seat.status != SeatStatus::Available {
            return Ok(false);
        }
        seat.status = SeatStatus::Reserved;
        seat.holder_id = Some(*holder_id);
        seat.reserved_at = Some(now);
        seat.expires_at = Some(hold_deadline);
        seat.version += 1;
        Ok(true)
    }

    async fn try_confirm_versioned(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        expected_version: i64,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(seat) = state.seats.get_mut(&(*scope_id, *unit_id)) else {
            return Ok(false);
        };
        if seat.version != expected_version
            || seat.status != SeatStatus::Reserved
            || seat.holder_id != Some(*holder_id)
        {
            return Ok(false);
        }
        seat.status = SeatStatus::Sold;
        seat.expires_at = None;
        seat.version += 1;
        Ok(true)
    }

    async fn reserve_locked(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<Seat> {
        let mut state = self.state.lock().await;
        let seat = state
            .seats
            .get_mut(&(*scope_id, *unit_id))
            .ok_or_else(Error::seat_not_found)?;
        if seat.status != SeatStatus::Available {
            return Err(Error::Conflict(format!("seat {unit_id} is not available")));
        }
        seat.status = SeatStatus::Reserved;
        seat.holder_id = Some(*holder_id);
        seat.reserved_at = Some(now);
        seat.expires_at = Some(hold_deadline);
        seat.version += 1;
        Ok(seat.clone())
    }

    async fn confirm_locked(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<Seat> {
        let mut state = self.state.lock().await;
        let seat = state
            .seats
            .get_mut(&(*scope_id, *unit_id))
            .ok_or_else(Error::seat_not_found)?;
        if seat.status != SeatStatus::Reserved || seat.holder_id != Some(*holder_id) {
            return Err(Error::Conflict(format!(
                "seat {unit_id} is not reserved by this holder"
            )));
        }
        seat.status = SeatStatus::Sold;
        seat.expires_at = None;
        seat.version += 1;
        Ok(seat.clone())
    }

    async fn find_expired_reserved(&self, cutoff: DateTime<Utc>) -> Result<Vec<Seat>> {
        let state = self.state.lock().await;
        let mut seats: Vec<Seat> = state
            .seats
            .values()
            .filter(|s| {
                s.status == SeatStatus::Reserved
                    && s.expires_at.is_some_and(|deadline| deadline <= cutoff)
            })
            .cloned()
            .collect();
        seats.sort_by_key(|s| s.expires_at);
        Ok(seats)
    }
}

#[allow(clippy::cast_possible_truncation)]
#[async_trait]
impl BalanceStore for MemoryStore {
    async fn create_if_absent(
        &self,
        subject_id: &SubjectId,
        initial: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.balances.entry(*subject_id).or_insert_with(|| Balance {
            subject_id: *subject_id,
            amount: initial,
            version: 0,
            last_updated_at: now,
        });
        Ok(())
    }

    async fn get_balance(&self, subject_id: &SubjectId) -> Result<Option<Balance>> {
        let state = self.state.lock().await;
        Ok(state.balances.get(subject_id).cloned())
    }

    async fn try_deduct(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(balance) = state.balances.get_mut(subject_id) else {
            return Ok(false);
        };
        if !balance.can_deduct(amount) {
            return Ok(false);
        }
        balance.amount -= amount;
        balance.version += 1;
        balance.last_updated_at = now;
        Ok(true)
    }

    async fn try_deduct_versioned(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(balance) = state.balances.get_mut(subject_id) else {
            return Ok(false);
        };
        if balance.version != expected_version || !balance.can_deduct(amount) {
            return Ok(false);
        }
        balance.amount -= amount;
        balance.version += 1;
        balance.last_updated_at = now;
        Ok(true)
    }

    async fn try_credit(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(balance) = state.balances.get_mut(subject_id) else {
            return Ok(false);
        };
        balance.amount += amount;
        balance.version += 1;
        balance.last_updated_at = now;
        Ok(true)
    }

    async fn try_credit_versioned(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(balance) = state.balances.get_mut(subject_id) else {
            return Ok(false);
        };
        if balance.version != expected_version {
            return Ok(false);
        }
        balance.amount += amount;
        balance.version += 1;
        balance.last_updated_at = now;
        Ok(true)
    }

    async fn deduct_locked(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        let mut state = self.state.lock().await;
        let balance = state
            .balances
            .get_mut(subject_id)
            .ok_or_else(|| Error::balance_not_found(subject_id))?;
        if !balance.can_deduct(amount) {
            return Err(Error::InsufficientFunds {
                available: balance.amount,
                requested: amount,
            });
        }
        balance.amount -= amount;
        balance.version += 1;
        balance.last_updated_at = now;
        Ok(balance.clone())
    }

    async fn credit_locked(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        let mut state = self.state.lock().await;
        let balance = state
            .balances
            .get_mut(subject_id)
            .ok_or_else(|| Error::balance_not_found(subject_id))?;
        balance.amount += amount;
        balance.version += 1;
        balance.last_updated_at = now;
        Ok(balance.clone())
    }

    async fn append_entry(&self, entry: &BalanceEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .balance_entries
            .entry(entry.subject_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn entries(&self, subject_id: &SubjectId) -> Result<Vec<BalanceEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .balance_entries
            .get(subject_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[allow(clippy::cast_possible_truncation)]
#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_if_no_live(&self, token: &QueueToken) -> Result<Option<QueueToken>> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .tokens
            .values()
            .find(|t| {
                t.subject_id == token.subject_id && t.scope_id == token.scope_id && t.is_live()
            })
            .cloned()
        {
            return Ok(Some(existing));
        }
        if state.tokens.contains_key(&token.token_id) {
            return Err(Error::Conflict(format!(
                "token {} already exists",
                token.token_id
            )));
        }
        state.tokens.insert(token.token_id, token.clone());
        Ok(None)
    }

    async fn get_token(&self, token_id: &TokenId) -> Result<Option<QueueToken>> {
        let state = self.state.lock().await;
        Ok(state.tokens.get(token_id).cloned())
    }

    async fn find_live_for_subject(
        &self,
        subject_id: &SubjectId,
        scope_id: &ScopeId,
    ) -> Result<Option<QueueToken>> {
        let state = self.state.lock().await;
        Ok(state
            .tokens
            .values()
            .find(|t| t.subject_id == *subject_id && t.scope_id == *scope_id && t.is_live())
            .cloned())
    }

    async fn count_active(&self, scope_id: &ScopeId) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(count_active_in(&state, scope_id))
    }

    async fn count_waiting_before(
        &self,
        scope_id: &ScopeId,
        created_at: DateTime<Utc>,
    ) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .tokens
            .values()
            .filter(|t| {
                t.scope_id == *scope_id
                    && t.status == TokenStatus::Waiting
                    && t.created_at < created_at
            })
            .count() as u64)
    }

    async fn oldest_waiting(&self, scope_id: &ScopeId, limit: u64) -> Result<Vec<QueueToken>> {
        let state = self.state.lock().await;
        let mut waiting: Vec<QueueToken> = state
            .tokens
            .values()
            .filter(|t| t.scope_id == *scope_id && t.status == TokenStatus::Waiting)
            .cloned()
            .collect();
        waiting.sort_by_key(|t| (t.created_at, t.token_id));
        waiting.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(waiting)
    }

    async fn activate_if_below_capacity(
        &self,
        token_id: &TokenId,
        capacity: u64,
        now: DateTime<Utc>,
        active_deadline: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let scope_id = match state.tokens.get(token_id) {
            Some(token) if token.status == TokenStatus::Waiting => token.scope_id,
            _ => return Ok(false),
        };
        if count_active_in(&state, &scope_id) >= capacity {
            return Ok(false);
        }
        if let Some(token) = state.tokens.get_mut(token_id) {
            token.status = TokenStatus::Active;
            token.position = None;
            token.activated_at = Some(now);
            token.expires_at = active_deadline;
        }
        Ok(true)
    }

    async fn mark_expired_if_live(&self, token_id: &TokenId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(token) = state.tokens.get_mut(token_id) else {
            return Ok(false);
        };
        if !token.is_live() {
            return Ok(false);
        }
        token.status = TokenStatus::Expired;
        token.position = None;
        Ok(true)
    }

    async fn mark_completed_if_active(&self, token_id: &TokenId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(token) = state.tokens.get_mut(token_id) else {
            return Ok(false);
        };
        if token.status != TokenStatus::Active {
            return Ok(false);
        }
        token.status = TokenStatus::Completed;
        token.position = None;
        Ok(true)
    }

    async fn find_expired_live(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueueToken>> {
        let state = self.state.lock().await;
        let mut expired: Vec<QueueToken> = state
            .tokens
            .values()
            .filter(|t| t.is_live() && t.expires_at <= cutoff)
            .cloned()
            .collect();
        expired.sort_by_key(|t| (t.expires_at, t.token_id));
        Ok(expired)
    }

    async fn scopes_with_live_tokens(&self) -> Result<Vec<ScopeId>> {
        let state = self.state.lock().await;
        let mut scopes: Vec<ScopeId> = state
            .tokens
            .values()
            .filter(|t| t.is_live())
            .map(|t| t.scope_id)
            .collect();
        scopes.sort_by_key(|s| *s.as_uuid());
        scopes.dedup();
        Ok(scopes)
    }
}
