//! Domain types for the admission control and resource concurrency engine.
//!
//! Value objects and records for the three contended entities: queue tokens
//! (who may act right now), seats (the strictly limited inventory units),
//! and balances (spendable funds). Amounts are integer cents to avoid
//! floating-point arithmetic errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a subject (a user or service acting on resources).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectId(Uuid);

impl SubjectId {
    /// Creates a new random `SubjectId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `SubjectId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a resource scope (the unit of contention grouping,
/// e.g. all seats of one event).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(Uuid);

impl ScopeId {
    /// Creates a new random `ScopeId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ScopeId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one contended unit inside a scope (a single seat).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(Uuid);

impl UnitId {
    /// Creates a new random `UnitId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UnitId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a queue token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(Uuid);

impl TokenId {
    /// Creates a new random `TokenId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `TokenId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Queue tokens
// ============================================================================

/// Lifecycle state of a queue token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenStatus {
    /// Queued behind the capacity limit; `position` is meaningful.
    Waiting,
    /// Admitted; the holder may act on the scope until the token expires.
    Active,
    /// Reclaimed by sweep or explicit expiry. Terminal.
    Expired,
    /// The holder finished its privileged work. Terminal.
    Completed,
}

impl TokenStatus {
    /// True for states a token can never leave.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Completed)
    }

    /// Store representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Completed => "COMPLETED",
        }
    }

    /// Parse the store representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(Self::Waiting),
            "ACTIVE" => Some(Self::Active),
            "EXPIRED" => Some(Self::Expired),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-bounded credential proving a subject may currently act on a scarce
/// resource scope.
///
/// Invariant: at most one non-terminal token exists per (subject, scope).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueToken {
    /// Token identity.
    pub token_id: TokenId,
    /// The subject this token admits.
    pub subject_id: SubjectId,
    /// The scope the token grants access to.
    pub scope_id: ScopeId,
    /// Current lifecycle state.
    pub status: TokenStatus,
    /// 1-based queue position; meaningful only while `Waiting`. Always
    /// derived from the store, never authoritative.
    pub position: Option<u64>,
    /// Issuance time; promotion order is FIFO by this field.
    pub created_at: DateTime<Utc>,
    /// Hard deadline after which the token is reclaimable.
    pub expires_at: DateTime<Utc>,
    /// When the token became `Active`, if it ever did.
    pub activated_at: Option<DateTime<Utc>>,
}

impl QueueToken {
    /// True once the deadline has passed, regardless of stored status.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True while the token still occupies the (subject, scope) slot.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}

// ============================================================================
// Seats (contended resource units)
// ============================================================================

/// Lifecycle state of a contended unit.
///
/// Legal transitions: `Available → Reserved`, `Reserved → Sold`,
/// `Reserved → Available` (expiry or release only).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeatStatus {
    /// Free for any subject to acquire.
    Available,
    /// Temporarily held by `holder_id` pending confirmation.
    Reserved,
    /// Permanently acquired.
    Sold,
}

impl SeatStatus {
    /// Store representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Reserved => "RESERVED",
            Self::Sold => "SOLD",
        }
    }

    /// Parse the store representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AVAILABLE" => Some(Self::Available),
            "RESERVED" => Some(Self::Reserved),
            "SOLD" => Some(Self::Sold),
            _ => None,
        }
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One strictly limited inventory unit.
///
/// Invariant: a unit whose status is not `Available` has exactly one holder;
/// two holders never own the same unit simultaneously. Created once at
/// inventory setup, never deleted, only transitioned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    /// Scope this unit belongs to.
    pub scope_id: ScopeId,
    /// Unit identity within the scope.
    pub unit_id: UnitId,
    /// Current lifecycle state.
    pub status: SeatStatus,
    /// Subject holding the reservation or sale, if any.
    pub holder_id: Option<SubjectId>,
    /// When the current hold was taken.
    pub reserved_at: Option<DateTime<Utc>>,
    /// Deadline for an unconfirmed hold; `None` once sold.
    pub expires_at: Option<DateTime<Utc>>,
    /// Monotonically increasing version for optimistic checks.
    pub version: i64,
}

impl Seat {
    /// A fresh, available unit.
    #[must_use]
    pub const fn available(scope_id: ScopeId, unit_id: UnitId) -> Self {
        Self {
            scope_id,
            unit_id,
            status: SeatStatus::Available,
            holder_id: None,
            reserved_at: None,
            expires_at: None,
            version: 0,
        }
    }

    /// True when the unit is reserved and the hold deadline has passed.
    #[must_use]
    pub fn hold_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SeatStatus::Reserved
            && self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

// ============================================================================
// Balances
// ============================================================================

/// A subject's spendable funds, in cents.
///
/// Invariant: `amount` never goes negative; every successful mutation
/// increases `version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Owning subject.
    pub subject_id: SubjectId,
    /// Current funds in cents.
    pub amount: u64,
    /// Monotonically increasing version for optimistic checks.
    pub version: i64,
    /// Time of the last successful mutation.
    pub last_updated_at: DateTime<Utc>,
}

impl Balance {
    /// True when a deduction of `amount` cents could currently be satisfied.
    #[must_use]
    pub const fn can_deduct(&self, amount: u64) -> bool {
        self.amount >= amount
    }
}

/// Direction of a balance mutation, for the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceEntryKind {
    /// Funds were removed.
    Deduct,
    /// Funds were added.
    Credit,
}

impl BalanceEntryKind {
    /// Store representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deduct => "DEDUCT",
            Self::Credit => "CREDIT",
        }
    }
}

/// One line of the balance audit trail, appended after every successful
/// deduct or credit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    /// Owning subject.
    pub subject_id: SubjectId,
    /// Direction of the mutation.
    pub kind: BalanceEntryKind,
    /// Mutation size in cents.
    pub amount: u64,
    /// Balance after the mutation committed.
    pub balance_after: u64,
    /// When the mutation committed.
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Response views
// ============================================================================

/// Queue token shape returned to outer layers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenView {
    /// Token identity (the credential itself).
    pub token_id: TokenId,
    /// Current lifecycle state.
    pub status: TokenStatus,
    /// Derived 1-based position while waiting.
    pub position: Option<u64>,
    /// Rough wait estimate for waiting tokens.
    pub estimated_wait_minutes: Option<u64>,
    /// Token deadline.
    pub expires_at: DateTime<Utc>,
}

/// Reservation shape returned to outer layers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationView {
    /// Scope of the unit.
    pub scope_id: ScopeId,
    /// The unit acted on.
    pub unit_id: UnitId,
    /// Resulting unit state.
    pub status: SeatStatus,
    /// Holder after the mutation.
    pub holder_id: Option<SubjectId>,
    /// Hold deadline, while reserved.
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<Seat> for ReservationView {
    fn from(seat: Seat) -> Self {
        Self {
            scope_id: seat.scope_id,
            unit_id: seat.unit_id,
            status: seat.status,
            holder_id: seat.holder_id,
            expires_at: seat.expires_at,
        }
    }
}

/// Balance shape returned to outer layers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    /// Owning subject.
    pub subject_id: SubjectId,
    /// Funds in cents after the operation.
    pub amount: u64,
    /// Record version after the operation.
    pub version: i64,
}

impl From<Balance> for BalanceView {
    fn from(balance: Balance) -> Self {
        Self {
            subject_id: balance.subject_id,
            amount: balance.amount,
            version: balance.version,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn token_status_round_trips_store_representation() {
        for status in [
            TokenStatus::Waiting,
            TokenStatus::Active,
            TokenStatus::Expired,
            TokenStatus::Completed,
        ] {
            assert_eq!(TokenStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TokenStatus::parse("BOGUS"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TokenStatus::Waiting.is_terminal());
        assert!(!TokenStatus::Active.is_terminal());
        assert!(TokenStatus::Expired.is_terminal());
        assert!(TokenStatus::Completed.is_terminal());
    }

    #[test]
    fn seat_hold_expiry_requires_reserved_status() {
        let now = Utc::now();
        let mut seat = Seat::available(ScopeId::new(), UnitId::new());
        seat.expires_at = Some(now - Duration::seconds(1));
        assert!(!seat.hold_expired_at(now));

        seat.status = SeatStatus::Reserved;
        assert!(seat.hold_expired_at(now));

        seat.expires_at = Some(now + Duration::minutes(5));
        assert!(!seat.hold_expired_at(now));
    }

    #[test]
    fn balance_deduction_predicate() {
        let balance = Balance {
            subject_id: SubjectId::new(),
            amount: 100,
            version: 0,
            last_updated_at: Utc::now(),
        };
        assert!(balance.can_deduct(100));
        assert!(!balance.can_deduct(101));
    }
}
