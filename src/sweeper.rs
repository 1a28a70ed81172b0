//! Background reclamation of lapsed holds and expired tokens.
//!
//! Two periodic passes: a frequent one returning lapsed reservation holds to
//! the pool, and a slower one expiring overdue tokens and backfilling the
//! freed slots. Each item is reclaimed with the same conditional updates the
//! foreground uses, so a sweep racing a confirmation can never claw back a
//! hold that just became a sale. One failed item never aborts a pass.

use crate::cache::ViewCache;
use crate::clock::Clock;
use crate::config::SweeperConfig;
use crate::error::Result;
use crate::queue::AdmissionQueue;
use crate::store::{SeatStore, TokenStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Periodic expiry sweeps over reservations and tokens.
pub struct ExpirySweeper {
    seats: Arc<dyn SeatStore>,
    tokens: Arc<dyn TokenStore>,
    queue: Arc<AdmissionQueue>,
    cache: Arc<ViewCache>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    /// Assemble a sweeper over the given stores.
    #[must_use]
    pub fn new(
        seats: Arc<dyn SeatStore>,
        tokens: Arc<dyn TokenStore>,
        queue: Arc<AdmissionQueue>,
        cache: Arc<ViewCache>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            seats,
            tokens,
            queue,
            cache,
            clock,
            config,
        }
    }

    /// Return every lapsed hold to the pool. Returns how many were released.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the candidate scan
    /// fails; failures on individual units are logged and skipped.
    pub async fn sweep_reservations(&self) -> Result<u64> {
        let now = self.clock.now();
        let candidates = self.seats.find_expired_reserved(now).await?;

        let mut released = 0u64;
        let mut touched_scopes = Vec::new();
        for seat in candidates {
            match self
                .seats
                .try_release_expired(&seat.scope_id, &seat.unit_id, now)
                .await
            {
                Ok(true) => {
                    released += 1;
                    crate::metrics::record_hold_released();
                    if !touched_scopes.contains(&seat.scope_id) {
                        touched_scopes.push(seat.scope_id);
                    }
                }
                // Confirmed or already released since the scan; skip.
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        scope_id = %seat.scope_id,
                        unit_id = %seat.unit_id,
                        error = %err,
                        "Failed to release lapsed hold"
                    );
                }
            }
        }

        for scope_id in touched_scopes {
            self.cache.invalidate_availability(&scope_id).await;
        }
        if released > 0 {
            tracing::info!(released, "Released lapsed reservation holds");
        }
        Ok(released)
    }

    /// Expire every overdue live token and backfill the freed slots.
    /// Returns how many tokens were expired.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the candidate or live
    /// scope scan fails; failures on individual tokens are logged and
    /// skipped.
    pub async fn sweep_tokens(&self) -> Result<u64> {
        let now = self.clock.now();
        let candidates = self.tokens.find_expired_live(now).await?;

        let mut expired = 0u64;
        for token in candidates {
            match self.tokens.mark_expired_if_live(&token.token_id).await {
                Ok(true) => {
                    expired += 1;
                    crate::metrics::record_token_expired();
                    self.cache
                        .invalidate_position(&token.subject_id, &token.token_id)
                        .await;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        token_id = %token.token_id,
                        error = %err,
                        "Failed to expire token"
                    );
                }
            }
        }

        // One promotion pass per scope that still has live tokens. Going by
        // live scopes rather than the scopes touched above also backfills
        // slots whose earlier promotion was missed.
        for scope_id in &self.tokens.scopes_with_live_tokens().await? {
            if let Err(err) = self.queue.promote_waiting(scope_id).await {
                tracing::warn!(
                    scope_id = %scope_id,
                    error = %err,
                    "Failed to promote waiters after expiry sweep"
                );
            }
        }
        if expired > 0 {
            tracing::info!(expired, "Expired overdue tokens");
        }
        Ok(expired)
    }

    /// Run both sweep loops until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut reservations =
            tokio::time::interval(Duration::from_secs(self.config.reservation_interval_secs.max(1)));
        let mut tokens =
            tokio::time::interval(Duration::from_secs(self.config.token_interval_secs.max(1)));
        reservations.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokens.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            reservation_interval_secs = self.config.reservation_interval_secs,
            token_interval_secs = self.config.token_interval_secs,
            "Expiry sweeper started"
        );
        loop {
            tokio::select! {
                _ = reservations.tick() => {
                    if let Err(err) = self.sweep_reservations().await {
                        tracing::error!(error = %err, "Reservation sweep failed");
                    }
                }
                _ = tokens.tick() => {
                    if let Err(err) = self.sweep_tokens().await {
                        tracing::error!(error = %err, "Token sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Expiry sweeper stopping");
                        return;
                    }
                }
            }
        }
    }
}
