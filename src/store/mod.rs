//! Persistence contracts for the contended records.
//!
//! Every mutating operation is expressed as a conditional update: the store
//! applies the change only if the row still satisfies the stated predicate,
//! and reports whether it did. All correctness rests on these predicates
//! evaluating atomically with the write; callers never get a
//! read-then-write gap. The Postgres implementation maps each method to a
//! single guarded `UPDATE` (or a `SELECT ... FOR UPDATE` transaction for the
//! `_locked` variants); the in-memory implementation serializes everything
//! behind one mutex, which gives the same observable semantics.
//!
//! Method families:
//! - `try_*`: predicate on current state only (status, sufficient funds).
//! - `try_*_versioned`: predicate on the record version read earlier; a
//!   version mismatch means someone else committed first.
//! - `*_locked`: take a row lock first, then mutate; used by the pessimistic
//!   strategy, where waiting replaces failing.

use crate::error::Result;
use crate::types::{
    Balance, BalanceEntry, QueueToken, ScopeId, Seat, SubjectId, TokenId, UnitId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Storage for the strictly limited inventory units.
#[async_trait]
pub trait SeatStore: Send + Sync {
    /// Add a unit to the inventory.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Conflict`] if the unit already exists,
    /// or [`crate::error::Error::Storage`] on store failure.
    async fn insert_seat(&self, seat: &Seat) -> Result<()>;

    /// Fetch one unit.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn get_seat(&self, scope_id: &ScopeId, unit_id: &UnitId) -> Result<Option<Seat>>;

    /// All currently available units of a scope, ordered by unit id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn list_available(&self, scope_id: &ScopeId) -> Result<Vec<Seat>>;

    /// Reserve the unit for `holder_id` if it is still available. Returns
    /// whether the hold was taken.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn try_reserve(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<bool>;

    /// Convert `holder_id`'s hold into a sale. Returns whether the row
    /// matched (reserved, by this holder).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn try_confirm(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<bool>;

    /// Return a reserved unit to the pool if its hold deadline is at or
    /// before `cutoff`. Returns whether the release happened.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn try_release_expired(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool>;

    /// Reserve the unit only if its version still equals `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn try_reserve_versioned(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        expected_version: i64,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<bool>;

    /// Confirm the unit only if its version still equals `expected_version`
    /// and the hold belongs to `holder_id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn try_confirm_versioned(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        expected_version: i64,
    ) -> Result<bool>;

    /// Reserve under a row lock, waiting for a concurrent holder of the lock
    /// rather than failing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::NotFound`] if the unit does not exist,
    /// [`crate::error::Error::Conflict`] if it is not available, or
    /// [`crate::error::Error::Storage`] on store failure.
    async fn reserve_locked(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<Seat>;

    /// Confirm under a row lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::NotFound`] if the unit does not exist,
    /// [`crate::error::Error::Conflict`] if it is not reserved by
    /// `holder_id`, or [`crate::error::Error::Storage`] on store failure.
    async fn confirm_locked(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<Seat>;

    /// All reserved units whose hold deadline is at or before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn find_expired_reserved(&self, cutoff: DateTime<Utc>) -> Result<Vec<Seat>>;
}

/// Storage for subject balances and their audit trail.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Create an account with `initial` cents if none exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn create_if_absent(
        &self,
        subject_id: &SubjectId,
        initial: u64,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Fetch one balance.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn get_balance(&self, subject_id: &SubjectId) -> Result<Option<Balance>>;

    /// Deduct `amount` cents if the balance covers it. Returns whether the
    /// deduction happened.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn try_deduct(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Deduct only if the version still equals `expected_version` and the
    /// balance covers the amount.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn try_deduct_versioned(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Add `amount` cents. Returns whether the account existed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn try_credit(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Credit only if the version still equals `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn try_credit_versioned(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Deduct under a row lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::NotFound`] if the account does not
    /// exist, [`crate::error::Error::InsufficientFunds`] if it cannot cover
    /// the amount, or [`crate::error::Error::Storage`] on store failure.
    async fn deduct_locked(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance>;

    /// Credit under a row lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::NotFound`] if the account does not
    /// exist, or [`crate::error::Error::Storage`] on store failure.
    async fn credit_locked(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance>;

    /// Append one audit line.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn append_entry(&self, entry: &BalanceEntry) -> Result<()>;

    /// Audit trail for a subject, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn entries(&self, subject_id: &SubjectId) -> Result<Vec<BalanceEntry>>;
}

/// Storage for queue tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a freshly issued token, unless the subject already holds a
    /// live token in the scope; then nothing is inserted and the existing
    /// token is returned. The live-token check and the insert are one
    /// atomic step, so concurrent issuance for one subject can never
    /// produce two live tokens.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn insert_if_no_live(&self, token: &QueueToken) -> Result<Option<QueueToken>>;

    /// Fetch one token.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn get_token(&self, token_id: &TokenId) -> Result<Option<QueueToken>>;

    /// The subject's non-terminal token for a scope, if any.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn find_live_for_subject(
        &self,
        subject_id: &SubjectId,
        scope_id: &ScopeId,
    ) -> Result<Option<QueueToken>>;

    /// Number of active tokens in a scope.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn count_active(&self, scope_id: &ScopeId) -> Result<u64>;

    /// Number of waiting tokens in a scope issued strictly before
    /// `created_at`. Positions are always derived from this count.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn count_waiting_before(
        &self,
        scope_id: &ScopeId,
        created_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Up to `limit` waiting tokens of a scope, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn oldest_waiting(&self, scope_id: &ScopeId, limit: u64) -> Result<Vec<QueueToken>>;

    /// Promote a waiting token to active only if the scope's active count is
    /// still below `capacity`. The capacity check and the status change are
    /// one atomic step, so concurrent promoters can never overshoot.
    /// Returns whether the promotion happened.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn activate_if_below_capacity(
        &self,
        token_id: &TokenId,
        capacity: u64,
        now: DateTime<Utc>,
        active_deadline: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move a live token to `Expired`. Idempotent: returns false for tokens
    /// already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn mark_expired_if_live(&self, token_id: &TokenId) -> Result<bool>;

    /// Move an active token to `Completed`. Returns false unless the token
    /// was active.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn mark_completed_if_active(&self, token_id: &TokenId) -> Result<bool>;

    /// All live tokens whose deadline is at or before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn find_expired_live(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueueToken>>;

    /// Scopes that currently have at least one live token. Drives the
    /// sweeper's promotion pass.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] on store failure.
    async fn scopes_with_live_tokens(&self) -> Result<Vec<ScopeId>>;
}

/// Everything the engine and queue need from one backing store.
pub trait Store: SeatStore + BalanceStore + TokenStore {}

impl<T: SeatStore + BalanceStore + TokenStore> Store for T {}
