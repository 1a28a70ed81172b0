//! Error types for the admission and concurrency engine.
//!
//! The taxonomy separates errors callers should never retry (validation,
//! business rules) from transient ones (`Timeout`, `BusyRetryExhausted`),
//! so outer layers can map each variant to a retry policy and status code
//! without string matching.

use crate::types::{SubjectId, TokenId};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input. Never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A referenced subject, resource, or token does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Lost a race for an exclusive resource. Surfaced to clients as
    /// "already taken"; blind auto-retry is not advisable.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Business rule: the balance cannot cover the requested amount.
    #[error("insufficient funds: balance {available} < requested {requested}")]
    InsufficientFunds {
        /// Current balance at the time of the attempt.
        available: u64,
        /// Amount the caller tried to deduct.
        requested: u64,
    },

    /// A lock or queue wait exceeded its deadline. The caller decides
    /// whether to retry.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The optimistic strategy exhausted its attempt budget. Transient;
    /// retry-after is advisable.
    #[error("busy: gave up after {attempts} optimistic attempts")]
    BusyRetryExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// The presented queue token is not currently active.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The referenced token or hold is past its deadline.
    #[error("expired: {0}")]
    Expired(String),

    /// Backing store failure (database or key-value store).
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Convenience constructor for a missing seat.
    #[must_use]
    pub fn seat_not_found() -> Self {
        Self::NotFound("seat".to_string())
    }

    /// Convenience constructor for a missing balance account.
    #[must_use]
    pub fn balance_not_found(subject_id: &SubjectId) -> Self {
        Self::NotFound(format!("balance for subject {subject_id}"))
    }

    /// Convenience constructor for a missing queue token.
    #[must_use]
    pub fn token_not_found(token_id: &TokenId) -> Self {
        Self::NotFound(format!("queue token {token_id}"))
    }

    /// True for errors a caller may reasonably retry after a short delay.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::BusyRetryExhausted { .. })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(format!("postgres: {err}"))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Storage(format!("redis: {err}"))
    }
}
