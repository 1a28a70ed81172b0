//! Waiting-queue admission control.
//!
//! A scope admits at most `capacity` active tokens at a time; everyone else
//! waits in FIFO order by issuance time. Waiting positions are never stored,
//! only derived by counting earlier waiting tokens, so they cannot drift
//! from the truth. Promotion happens opportunistically whenever a slot
//! frees (completion, expiry) and periodically from the sweeper.

use crate::cache::ViewCache;
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::store::TokenStore;
use crate::types::{QueueToken, ScopeId, SubjectId, TokenId, TokenStatus, TokenView};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Token lifecycle operations for one deployment.
pub struct AdmissionQueue {
    store: Arc<dyn TokenStore>,
    cache: Arc<ViewCache>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl AdmissionQueue {
    /// Assemble a queue over the given token store.
    #[must_use]
    pub fn new(
        store: Arc<dyn TokenStore>,
        cache: Arc<ViewCache>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            config,
        }
    }

    /// Issue a token admitting `subject_id` to `scope_id`, or return the
    /// subject's existing live token. A live token whose deadline has
    /// already passed is expired first and a fresh one issued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    pub async fn issue_token(
        &self,
        subject_id: &SubjectId,
        scope_id: &ScopeId,
    ) -> Result<TokenView> {
        let now = self.clock.now();

        if let Some(existing) = self.store.find_live_for_subject(subject_id, scope_id).await? {
            if existing.is_expired_at(now) {
                if self.store.mark_expired_if_live(&existing.token_id).await? {
                    crate::metrics::record_token_expired();
                    self.cache
                        .invalidate_position(subject_id, &existing.token_id)
                        .await;
                }
            } else {
                tracing::debug!(
                    subject_id = %subject_id,
                    scope_id = %scope_id,
                    token_id = %existing.token_id,
                    "Reissuing existing live token"
                );
                return self.view_of(&existing, now).await;
            }
        }

        let token = QueueToken {
            token_id: TokenId::new(),
            subject_id: *subject_id,
            scope_id: *scope_id,
            status: TokenStatus::Waiting,
            position: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.waiting_ttl_secs),
            activated_at: None,
        };
        // The insert itself arbitrates concurrent issuance: exactly one
        // caller inserts, everyone else is handed the surviving token.
        if let Some(existing) = self.store.insert_if_no_live(&token).await? {
            tracing::debug!(
                subject_id = %subject_id,
                scope_id = %scope_id,
                token_id = %existing.token_id,
                "Concurrent issue resolved to the surviving live token"
            );
            return self.view_of(&existing, now).await;
        }

        // Every token starts out waiting; admission goes through the same
        // capacity-guarded promotion as the queue drain, so concurrent
        // issuers cannot overshoot the limit.
        let active_deadline = now + chrono::Duration::seconds(self.config.active_ttl_secs);
        let admitted = self
            .store
            .activate_if_below_capacity(&token.token_id, self.config.capacity, now, active_deadline)
            .await?;

        let token = self
            .store
            .get_token(&token.token_id)
            .await?
            .ok_or_else(|| Error::token_not_found(&token.token_id))?;
        crate::metrics::record_token_issued(if admitted { "ACTIVE" } else { "WAITING" });
        tracing::info!(
            subject_id = %subject_id,
            scope_id = %scope_id,
            token_id = %token.token_id,
            status = %token.status,
            "Token issued"
        );
        self.view_of(&token, now).await
    }

    /// Current state of `subject_id`'s token. Waiting positions are served
    /// through the short-TTL cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown token,
    /// [`Error::Unauthorized`] when the token belongs to someone else,
    /// [`Error::Expired`] when it is past its deadline, or
    /// [`Error::Storage`] on store failure.
    pub async fn token_status(
        &self,
        subject_id: &SubjectId,
        token_id: &TokenId,
    ) -> Result<TokenView> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| Error::token_not_found(token_id))?;
        if token.subject_id != *subject_id {
            return Err(Error::Unauthorized(format!(
                "token {token_id} belongs to another subject"
            )));
        }
        let now = self.clock.now();
        // A lapsed deadline fails here even before the sweeper has repaired
        // the stored status.
        if token.status == TokenStatus::Expired
            || (token.is_live() && token.is_expired_at(now))
        {
            return Err(Error::Expired(format!("token {token_id}")));
        }
        self.view_of(&token, now).await
    }

    /// Check that `token_id` currently admits `subject_id` to `scope_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] when the token is unknown, belongs to
    /// someone else, targets another scope, is not active, or is past its
    /// deadline; or [`Error::Storage`] on store failure.
    pub async fn validate_active(
        &self,
        subject_id: &SubjectId,
        scope_id: &ScopeId,
        token_id: &TokenId,
    ) -> Result<()> {
        let token = self.store.get_token(token_id).await?.ok_or_else(|| {
            Error::Unauthorized(format!("token {token_id} is not recognized"))
        })?;
        if token.subject_id != *subject_id || token.scope_id != *scope_id {
            return Err(Error::Unauthorized(format!(
                "token {token_id} does not admit this subject to this scope"
            )));
        }
        if token.status != TokenStatus::Active {
            return Err(Error::Unauthorized(format!(
                "token {token_id} is {}",
                token.status
            )));
        }
        if token.is_expired_at(self.clock.now()) {
            return Err(Error::Unauthorized(format!(
                "token {token_id} is past its deadline"
            )));
        }
        Ok(())
    }

    /// Mark the subject's active token as completed and promote the next
    /// waiter into the freed slot. Completing an already completed token is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown token,
    /// [`Error::Unauthorized`] for someone else's token,
    /// [`Error::Conflict`] for a token that never became active,
    /// [`Error::Expired`] for an expired one, or [`Error::Storage`] on
    /// store failure.
    pub async fn complete_token(
        &self,
        subject_id: &SubjectId,
        token_id: &TokenId,
    ) -> Result<()> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| Error::token_not_found(token_id))?;
        if token.subject_id != *subject_id {
            return Err(Error::Unauthorized(format!(
                "token {token_id} belongs to another subject"
            )));
        }

        if self.store.mark_completed_if_active(token_id).await? {
            tracing::info!(token_id = %token_id, "Token completed");
            self.cache.invalidate_position(subject_id, token_id).await;
            self.promote_waiting(&token.scope_id).await?;
            return Ok(());
        }
        match token.status {
            TokenStatus::Completed => Ok(()),
            TokenStatus::Expired => Err(Error::Expired(format!("token {token_id}"))),
            TokenStatus::Waiting | TokenStatus::Active => Err(Error::Conflict(format!(
                "token {token_id} is not active"
            ))),
        }
    }

    /// Administratively expire a live token and backfill its slot. Expiring
    /// a token that is already terminal is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown token, or
    /// [`Error::Storage`] on store failure.
    pub async fn expire_token(&self, token_id: &TokenId) -> Result<()> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| Error::token_not_found(token_id))?;
        if self.store.mark_expired_if_live(token_id).await? {
            crate::metrics::record_token_expired();
            tracing::info!(token_id = %token_id, "Token expired");
            self.cache
                .invalidate_position(&token.subject_id, token_id)
                .await;
            self.promote_waiting(&token.scope_id).await?;
        }
        Ok(())
    }

    /// Promote waiting tokens, oldest first, until the scope is at capacity
    /// or the queue is empty. Returns how many were promoted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    pub async fn promote_waiting(&self, scope_id: &ScopeId) -> Result<u64> {
        let now = self.clock.now();
        let free = self
            .config
            .capacity
            .saturating_sub(self.store.count_active(scope_id).await?);
        if free == 0 {
            return Ok(0);
        }
        // The free-slot count only sizes the candidate fetch; each promotion
        // still goes through the capacity-guarded conditional update.
        let active_deadline = now + chrono::Duration::seconds(self.config.active_ttl_secs);
        let candidates = self.store.oldest_waiting(scope_id, free).await?;

        let mut promoted = 0u64;
        for token in candidates {
            if !self
                .store
                .activate_if_below_capacity(
                    &token.token_id,
                    self.config.capacity,
                    now,
                    active_deadline,
                )
                .await?
            {
                // At capacity; later candidates cannot fit either.
                break;
            }
            promoted += 1;
            self.cache
                .invalidate_position(&token.subject_id, &token.token_id)
                .await;
        }

        if promoted > 0 {
            crate::metrics::record_tokens_promoted(promoted);
            tracing::info!(scope_id = %scope_id, promoted, "Promoted waiting tokens");
        }
        Ok(promoted)
    }

    /// Rough wait estimate: full promotion cycles needed before this
    /// position reaches the front, times the cycle length.
    fn estimate_wait_minutes(&self, position: u64) -> u64 {
        position.div_ceil(self.config.capacity.max(1)) * self.config.promotion_cycle_minutes
    }

    async fn view_of(&self, token: &QueueToken, now: DateTime<Utc>) -> Result<TokenView> {
        // Report a lapsed deadline as expired even before the sweeper has
        // repaired the stored status.
        let status = if token.is_live() && token.is_expired_at(now) {
            TokenStatus::Expired
        } else {
            token.status
        };

        let position = if status == TokenStatus::Waiting {
            Some(self.derived_position(token).await?)
        } else {
            None
        };

        Ok(TokenView {
            token_id: token.token_id,
            status,
            position,
            estimated_wait_minutes: position.map(|p| self.estimate_wait_minutes(p)),
            expires_at: token.expires_at,
        })
    }

    async fn derived_position(&self, token: &QueueToken) -> Result<u64> {
        let store = Arc::clone(&self.store);
        let scope_id = token.scope_id;
        let created_at = token.created_at;
        self.cache
            .position(&token.subject_id, &token.token_id, move || async move {
                Ok(store.count_waiting_before(&scope_id, created_at).await? + 1)
            })
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::kv::MemoryKeyValueStore;
    use crate::store::MemoryStore;

    fn queue_with_capacity(capacity: u64) -> (Arc<ManualClock>, AdmissionQueue) {
        let clock = Arc::new(ManualClock::starting_now());
        let kv = Arc::new(MemoryKeyValueStore::new(clock.clone()));
        let cache = Arc::new(ViewCache::new(kv, CacheConfig::default()));
        let queue = AdmissionQueue::new(
            Arc::new(MemoryStore::new()),
            cache,
            clock.clone(),
            QueueConfig {
                capacity,
                ..QueueConfig::default()
            },
        );
        (clock, queue)
    }

    #[tokio::test]
    async fn admits_up_to_capacity_then_queues() {
        let (_, queue) = queue_with_capacity(2);
        let scope = ScopeId::new();

        let a = queue.issue_token(&SubjectId::new(), &scope).await.unwrap();
        let b = queue.issue_token(&SubjectId::new(), &scope).await.unwrap();
        let c = queue.issue_token(&SubjectId::new(), &scope).await.unwrap();

        assert_eq!(a.status, TokenStatus::Active);
        assert_eq!(b.status, TokenStatus::Active);
        assert_eq!(c.status, TokenStatus::Waiting);
        assert_eq!(c.position, Some(1));
        assert_eq!(c.estimated_wait_minutes, Some(1));
    }

    #[tokio::test]
    async fn reissue_returns_the_same_live_token() {
        let (_, queue) = queue_with_capacity(1);
        let scope = ScopeId::new();
        let subject = SubjectId::new();

        let first = queue.issue_token(&subject, &scope).await.unwrap();
        let again = queue.issue_token(&subject, &scope).await.unwrap();
        assert_eq!(first.token_id, again.token_id);
    }

    #[tokio::test]
    async fn completion_promotes_the_oldest_waiter() {
        let (_, queue) = queue_with_capacity(1);
        let scope = ScopeId::new();
        let front = SubjectId::new();
        let second = SubjectId::new();

        let front_token = queue.issue_token(&front, &scope).await.unwrap();
        let second_token = queue.issue_token(&second, &scope).await.unwrap();
        assert_eq!(second_token.status, TokenStatus::Waiting);

        queue.complete_token(&front, &front_token.token_id).await.unwrap();

        let promoted = queue
            .token_status(&second, &second_token.token_id)
            .await
            .unwrap();
        assert_eq!(promoted.status, TokenStatus::Active);
    }

    #[tokio::test]
    async fn wait_estimate_scales_with_position_and_capacity() {
        let (_, queue) = queue_with_capacity(10);
        assert_eq!(queue.estimate_wait_minutes(1), 1);
        assert_eq!(queue.estimate_wait_minutes(10), 1);
        assert_eq!(queue.estimate_wait_minutes(11), 2);
        assert_eq!(queue.estimate_wait_minutes(25), 3);
    }
}
