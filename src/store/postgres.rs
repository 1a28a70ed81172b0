//! Postgres implementation of the store contracts.
//!
//! Conditional updates are single guarded `UPDATE` statements judged by
//! `rows_affected`; the `_locked` variants run `SELECT ... FOR UPDATE`
//! inside a transaction. Statuses are stored as their text representation.

use crate::error::{Error, Result};
use crate::types::{
    Balance, BalanceEntry, BalanceEntryKind, QueueToken, ScopeId, Seat, SeatStatus, SubjectId,
    TokenId, TokenStatus, UnitId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{BalanceStore, SeatStore, TokenStore};

/// Postgres-backed implementation of all three store contracts.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the pool cannot be created or a
    /// migration fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| Error::Storage(format!("migration: {err}")))?;
        Ok(Self { pool })
    }

    /// The underlying pool, for callers that need raw access in tests.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Amounts are u64 cents in the domain and BIGINT in the schema.
fn cents(amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| Error::Validation(format!("amount {amount} out of range")))
}

fn uncents(amount: i64) -> Result<u64> {
    u64::try_from(amount)
        .map_err(|_| Error::Storage(format!("negative amount {amount} in store")))
}

fn seat_from_row(row: &PgRow) -> Result<Seat> {
    let status: String = row.get("status");
    let status = SeatStatus::parse(&status)
        .ok_or_else(|| Error::Storage(format!("unknown seat status {status}")))?;
    Ok(Seat {
        scope_id: ScopeId::from_uuid(row.get("scope_id")),
        unit_id: UnitId::from_uuid(row.get("unit_id")),
        status,
        holder_id: row
            .get::<Option<Uuid>, _>("holder_id")
            .map(SubjectId::from_uuid),
        reserved_at: row.get("reserved_at"),
        expires_at: row.get("expires_at"),
        version: row.get("version"),
    })
}

fn balance_from_row(row: &PgRow) -> Result<Balance> {
    Ok(Balance {
        subject_id: SubjectId::from_uuid(row.get("subject_id")),
        amount: uncents(row.get("amount"))?,
        version: row.get("version"),
        last_updated_at: row.get("last_updated_at"),
    })
}

fn token_from_row(row: &PgRow) -> Result<QueueToken> {
    let status: String = row.get("status");
    let status = TokenStatus::parse(&status)
        .ok_or_else(|| Error::Storage(format!("unknown token status {status}")))?;
    Ok(QueueToken {
        token_id: TokenId::from_uuid(row.get("token_id")),
        subject_id: SubjectId::from_uuid(row.get("subject_id")),
        scope_id: ScopeId::from_uuid(row.get("scope_id")),
        status,
        position: None,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        activated_at: row.get("activated_at"),
    })
}

#[async_trait]
impl SeatStore for PostgresStore {
    async fn insert_seat(&self, seat: &Seat) -> Result<()> {
        let result = sqlx::query(
            r"INSERT INTO seats (scope_id, unit_id, status, holder_id, reserved_at, expires_at, version)
              VALUES ($1, $2, $3, $4, $5, $6, $7)
              ON CONFLICT (scope_id, unit_id) DO NOTHING",
        )
        .bind(seat.scope_id.as_uuid())
        .bind(seat.unit_id.as_uuid())
        .bind(seat.status.as_str())
        .bind(seat.holder_id.map(|h| *h.as_uuid()))
        .bind(seat.reserved_at)
        .bind(seat.expires_at)
        .bind(seat.version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "seat {}/{} already exists",
                seat.scope_id, seat.unit_id
            )));
        }
        Ok(())
    }

    async fn get_seat(&self, scope_id: &ScopeId, unit_id: &UnitId) -> Result<Option<Seat>> {
        let row = sqlx::query("SELECT * FROM seats WHERE scope_id = $1 AND unit_id = $2")
            .bind(scope_id.as_uuid())
            .bind(unit_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(seat_from_row).transpose()
    }

    async fn list_available(&self, scope_id: &ScopeId) -> Result<Vec<Seat>> {
        let rows = sqlx::query(
            "SELECT * FROM seats WHERE scope_id = $1 AND status = 'AVAILABLE' ORDER BY unit_id",
        )
        .bind(scope_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(seat_from_row).collect()
    }

    async fn try_reserve(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE seats
              SET status = 'RESERVED', holder_id = $3, reserved_at = $4,
                  expires_at = $5, version = version + 1
              WHERE scope_id = $1 AND unit_id = $2 AND status = 'AVAILABLE'",
        )
        .bind(scope_id.as_uuid())
        .bind(unit_id.as_uuid())
        .bind(holder_id.as_uuid())
        .bind(now)
        .bind(hold_deadline)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_confirm(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE seats
              SET status = 'SOLD', expires_at = NULL, version = version + 1
              WHERE scope_id = $1 AND unit_id = $2
                AND status = 'RESERVED' AND holder_id = $3",
        )
        .bind(scope_id.as_uuid())
        .bind(unit_id.as_uuid())
        .bind(holder_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_release_expired(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE seats
              SET status = 'AVAILABLE', holder_id = NULL, reserved_at = NULL,
                  expires_at = NULL, version = version + 1
              WHERE scope_id = $1 AND unit_id = $2
                AND status = 'RESERVED' AND expires_at <= $3",
        )
        .bind(scope_id.as_uuid())
        .bind(unit_id.as_uuid())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
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
        let result = sqlx::query(
            r"UPDATE seats
              SET status = 'RESERVED', holder_id = $3, reserved_at = $4,
                  expires_at = $5, version = version + 1
              WHERE scope_id = $1 AND unit_id = $2
                AND version = $6 AND status = 'AVAILABLE'",
        )
        .bind(scope_id.as_uuid())
        .bind(unit_id.as_uuid())
        .bind(holder_id.as_uuid())
        .bind(now)
        .bind(hold_deadline)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_confirm_versioned(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE seats
              SET status = 'SOLD', expires_at = NULL, version = version + 1
              WHERE scope_id = $1 AND unit_id = $2
                AND version = $4 AND status = 'RESERVED' AND holder_id = $3",
        )
        .bind(scope_id.as_uuid())
        .bind(unit_id.as_uuid())
        .bind(holder_id.as_uuid())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reserve_locked(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
        now: DateTime<Utc>,
        hold_deadline: DateTime<Utc>,
    ) -> Result<Seat> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT * FROM seats WHERE scope_id = $1 AND unit_id = $2 FOR UPDATE",
        )
        .bind(scope_id.as_uuid())
        .bind(unit_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let seat = row
            .as_ref()
            .map(seat_from_row)
            .transpose()?
            .ok_or_else(Error::seat_not_found)?;
        if seat.status != SeatStatus::Available {
            return Err(Error::Conflict(format!("seat {unit_id} is not available")));
        }

        let row = sqlx::query(
            r"UPDATE seats
              SET status = 'RESERVED', holder_id = $3, reserved_at = $4,
                  expires_at = $5, version = version + 1
              WHERE scope_id = $1 AND unit_id = $2
              RETURNING *",
        )
        .bind(scope_id.as_uuid())
        .bind(unit_id.as_uuid())
        .bind(holder_id.as_uuid())
        .bind(now)
        .bind(hold_deadline)
        .fetch_one(&mut *tx)
        .await?;
        let updated = seat_from_row(&row)?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn confirm_locked(
        &self,
        scope_id: &ScopeId,
        unit_id: &UnitId,
        holder_id: &SubjectId,
    ) -> Result<Seat> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT * FROM seats WHERE scope_id = $1 AND unit_id = $2 FOR UPDATE",
        )
        .bind(scope_id.as_uuid())
        .bind(unit_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let seat = row
            .as_ref()
            .map(seat_from_row)
            .transpose()?
            .ok_or_else(Error::seat_not_found)?;
        if seat.status != SeatStatus::Reserved || seat.holder_id != Some(*holder_id) {
            return Err(Error::Conflict(format!(
                "seat {unit_id} is not reserved by this holder"
            )));
        }

        let row = sqlx::query(
            r"UPDATE seats
              SET status = 'SOLD', expires_at = NULL, version = version + 1
              WHERE scope_id = $1 AND unit_id = $2
              RETURNING *",
        )
        .bind(scope_id.as_uuid())
        .bind(unit_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        let updated = seat_from_row(&row)?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn find_expired_reserved(&self, cutoff: DateTime<Utc>) -> Result<Vec<Seat>> {
        let rows = sqlx::query(
            r"SELECT * FROM seats
              WHERE status = 'RESERVED' AND expires_at <= $1
              ORDER BY expires_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(seat_from_row).collect()
    }
}

#[async_trait]
impl BalanceStore for PostgresStore {
    async fn create_if_absent(
        &self,
        subject_id: &SubjectId,
        initial: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"INSERT INTO balances (subject_id, amount, version, last_updated_at)
              VALUES ($1, $2, 0, $3)
              ON CONFLICT (subject_id) DO NOTHING",
        )
        .bind(subject_id.as_uuid())
        .bind(cents(initial)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_balance(&self, subject_id: &SubjectId) -> Result<Option<Balance>> {
        let row = sqlx::query("SELECT * FROM balances WHERE subject_id = $1")
            .bind(subject_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn try_deduct(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE balances
              SET amount = amount - $2, version = version + 1, last_updated_at = $3
              WHERE subject_id = $1 AND amount >= $2",
        )
        .bind(subject_id.as_uuid())
        .bind(cents(amount)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_deduct_versioned(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE balances
              SET amount = amount - $2, version = version + 1, last_updated_at = $3
              WHERE subject_id = $1 AND version = $4 AND amount >= $2",
        )
        .bind(subject_id.as_uuid())
        .bind(cents(amount)?)
        .bind(now)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_credit(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE balances
              SET amount = amount + $2, version = version + 1, last_updated_at = $3
              WHERE subject_id = $1",
        )
        .bind(subject_id.as_uuid())
        .bind(cents(amount)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_credit_versioned(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE balances
              SET amount = amount + $2, version = version + 1, last_updated_at = $3
              WHERE subject_id = $1 AND version = $4",
        )
        .bind(subject_id.as_uuid())
        .bind(cents(amount)?)
        .bind(now)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deduct_locked(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM balances WHERE subject_id = $1 FOR UPDATE")
            .bind(subject_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let balance = row
            .as_ref()
            .map(balance_from_row)
            .transpose()?
            .ok_or_else(|| Error::balance_not_found(subject_id))?;
        if !balance.can_deduct(amount) {
            return Err(Error::InsufficientFunds {
                available: balance.amount,
                requested: amount,
            });
        }

        let row = sqlx::query(
            r"UPDATE balances
              SET amount = amount - $2, version = version + 1, last_updated_at = $3
              WHERE subject_id = $1
              RETURNING *",
        )
        .bind(subject_id.as_uuid())
        .bind(cents(amount)?)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let updated = balance_from_row(&row)?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn credit_locked(
        &self,
        subject_id: &SubjectId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM balances WHERE subject_id = $1 FOR UPDATE")
            .bind(subject_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        if row.is_none() {
            return Err(Error::balance_not_found(subject_id));
        }

        let row = sqlx::query(
            r"UPDATE balances
              SET amount = amount + $2, version = version + 1, last_updated_at = $3
              WHERE subject_id = $1
              RETURNING *",
        )
        .bind(subject_id.as_uuid())
        .bind(cents(amount)?)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let updated = balance_from_row(&row)?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn append_entry(&self, entry: &BalanceEntry) -> Result<()> {
        sqlx::query(
            r"INSERT INTO balance_entries (subject_id, kind, amount, balance_after, recorded_at)
              VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.subject_id.as_uuid())
        .bind(entry.kind.as_str())
        .bind(cents(entry.amount)?)
        .bind(cents(entry.balance_after)?)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entries(&self, subject_id: &SubjectId) -> Result<Vec<BalanceEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM balance_entries WHERE subject_id = $1 ORDER BY id",
        )
        .bind(subject_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let kind = match kind.as_str() {
                    "DEDUCT" => BalanceEntryKind::Deduct,
                    "CREDIT" => BalanceEntryKind::Credit,
                    other => {
                        return Err(Error::Storage(format!("unknown entry kind {other}")));
                    }
                };
                Ok(BalanceEntry {
                    subject_id: SubjectId::from_uuid(row.get("subject_id")),
                    kind,
                    amount: uncents(row.get("amount"))?,
                    balance_after: uncents(row.get("balance_after"))?,
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl TokenStore for PostgresStore {
    async fn insert_if_no_live(&self, token: &QueueToken) -> Result<Option<QueueToken>> {
        // The partial unique index on live (subject, scope) pairs arbitrates
        // concurrent issuance; a loser reads back the surviving token. The
        // re-read can miss when the survivor goes terminal in between, so
        // the insert gets one more chance before giving up.
        for _ in 0..2 {
            let result = sqlx::query(
                r"INSERT INTO queue_tokens
                      (token_id, subject_id, scope_id, status, created_at, expires_at,
                       activated_at)
                  VALUES ($1, $2, $3, $4, $5, $6, $7)
                  ON CONFLICT (subject_id, scope_id)
                      WHERE status IN ('WAITING', 'ACTIVE')
                      DO NOTHING",
            )
            .bind(token.token_id.as_uuid())
            .bind(token.subject_id.as_uuid())
            .bind(token.scope_id.as_uuid())
            .bind(token.status.as_str())
            .bind(token.created_at)
            .bind(token.expires_at)
            .bind(token.activated_at)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                return Ok(None);
            }
            if let Some(existing) = self
                .find_live_for_subject(&token.subject_id, &token.scope_id)
                .await?
            {
                return Ok(Some(existing));
            }
        }
        Err(Error::Conflict(format!(
            "could not issue a token for subject {} in scope {}",
            token.subject_id, token.scope_id
        )))
    }

    async fn get_token(&self, token_id: &TokenId) -> Result<Option<QueueToken>> {
        let row = sqlx::query("SELECT * FROM queue_tokens WHERE token_id = $1")
            .bind(token_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn find_live_for_subject(
        &self,
        subject_id: &SubjectId,
        scope_id: &ScopeId,
    ) -> Result<Option<QueueToken>> {
        let row = sqlx::query(
            r"SELECT * FROM queue_tokens
              WHERE subject_id = $1 AND scope_id = $2
                AND status IN ('WAITING', 'ACTIVE')",
        )
        .bind(subject_id.as_uuid())
        .bind(scope_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn count_active(&self, scope_id: &ScopeId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_tokens WHERE scope_id = $1 AND status = 'ACTIVE'",
        )
        .bind(scope_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn count_waiting_before(
        &self,
        scope_id: &ScopeId,
        created_at: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM queue_tokens
              WHERE scope_id = $1 AND status = 'WAITING' AND created_at < $2",
        )
        .bind(scope_id.as_uuid())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn oldest_waiting(&self, scope_id: &ScopeId, limit: u64) -> Result<Vec<QueueToken>> {
        let rows = sqlx::query(
            r"SELECT * FROM queue_tokens
              WHERE scope_id = $1 AND status = 'WAITING'
              ORDER BY created_at, token_id
              LIMIT $2",
        )
        .bind(scope_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(token_from_row).collect()
    }

    async fn activate_if_below_capacity(
        &self,
        token_id: &TokenId,
        capacity: u64,
        now: DateTime<Utc>,
        active_deadline: DateTime<Utc>,
    ) -> Result<bool> {
        // Serialize promoters per scope with an advisory lock, so the active
        // count and the status change see one consistent snapshot.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT scope_id, status FROM queue_tokens WHERE token_id = $1 FOR UPDATE",
        )
        .bind(token_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let status: String = row.get("status");
        if TokenStatus::parse(&status) != Some(TokenStatus::Waiting) {
            return Ok(false);
        }
        let scope_id: Uuid = row.get("scope_id");

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(scope_id)
            .execute(&mut *tx)
            .await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_tokens WHERE scope_id = $1 AND status = 'ACTIVE'",
        )
        .bind(scope_id)
        .fetch_one(&mut *tx)
        .await?;
        if u64::try_from(active).unwrap_or(0) >= capacity {
            return Ok(false);
        }

        sqlx::query(
            r"UPDATE queue_tokens
              SET status = 'ACTIVE', activated_at = $2, expires_at = $3
              WHERE token_id = $1",
        )
        .bind(token_id.as_uuid())
        .bind(now)
        .bind(active_deadline)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_expired_if_live(&self, token_id: &TokenId) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE queue_tokens SET status = 'EXPIRED'
              WHERE token_id = $1 AND status IN ('WAITING', 'ACTIVE')",
        )
        .bind(token_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed_if_active(&self, token_id: &TokenId) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE queue_tokens SET status = 'COMPLETED'
              WHERE token_id = $1 AND status = 'ACTIVE'",
        )
        .bind(token_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_expired_live(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueueToken>> {
        let rows = sqlx::query(
            r"SELECT * FROM queue_tokens
              WHERE status IN ('WAITING', 'ACTIVE') AND expires_at <= $1
              ORDER BY expires_at, token_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(token_from_row).collect()
    }

    async fn scopes_with_live_tokens(&self) -> Result<Vec<ScopeId>> {
        let rows: Vec<Uuid> = sqlx::query_scalar(
            r"SELECT DISTINCT scope_id FROM queue_tokens
              WHERE status IN ('WAITING', 'ACTIVE')
              ORDER BY scope_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ScopeId::from_uuid).collect())
    }
}
