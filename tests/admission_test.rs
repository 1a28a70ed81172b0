//! Waiting-queue token lifecycle: admission, derived positions, FIFO
//! promotion, expiry and reissue.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use turnstile::{
    AdmissionQueue, CacheConfig, Error, ManualClock, MemoryKeyValueStore, MemoryStore,
    QueueConfig, ScopeId, SubjectId, TokenId, TokenStatus, ViewCache,
};

fn queue(capacity: u64) -> (Arc<ManualClock>, AdmissionQueue) {
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

/// Issue tokens spaced one second apart so issuance order is unambiguous.
async fn issue_spaced(
    queue: &AdmissionQueue,
    clock: &ManualClock,
    scope: &ScopeId,
    count: usize,
) -> Vec<(SubjectId, TokenId)> {
    let mut issued = Vec::new();
    for _ in 0..count {
        let subject = SubjectId::new();
        let view = queue.issue_token(&subject, scope).await.unwrap();
        issued.push((subject, view.token_id));
        clock.advance(chrono::Duration::seconds(1));
    }
    issued
}

#[tokio::test]
async fn waiting_positions_reflect_issuance_order() {
    let (clock, queue) = queue(2);
    let scope = ScopeId::new();
    let issued = issue_spaced(&queue, &clock, &scope, 5).await;

    for (i, (subject, token_id)) in issued.iter().enumerate() {
        let view = queue.token_status(subject, token_id).await.unwrap();
        if i < 2 {
            assert_eq!(view.status, TokenStatus::Active);
            assert_eq!(view.position, None);
        } else {
            assert_eq!(view.status, TokenStatus::Waiting);
            assert_eq!(view.position, Some(i as u64 - 1));
        }
    }
}

#[tokio::test]
async fn promotion_is_fifo() {
    let (clock, queue) = queue(1);
    let scope = ScopeId::new();
    let issued = issue_spaced(&queue, &clock, &scope, 3).await;

    queue.complete_token(&issued[0].0, &issued[0].1).await.unwrap();

    let second = queue.token_status(&issued[1].0, &issued[1].1).await.unwrap();
    assert_eq!(second.status, TokenStatus::Active);

    // The position cache may still hold the old view briefly; read past its
    // TTL for the authoritative position.
    clock.advance(chrono::Duration::seconds(11));
    let third = queue.token_status(&issued[2].0, &issued[2].1).await.unwrap();
    assert_eq!(third.status, TokenStatus::Waiting);
    assert_eq!(third.position, Some(1));
}

#[tokio::test]
async fn scopes_are_independent() {
    let (_, queue) = queue(1);
    let subject = SubjectId::new();
    let (scope_a, scope_b) = (ScopeId::new(), ScopeId::new());

    let a = queue.issue_token(&subject, &scope_a).await.unwrap();
    let b = queue.issue_token(&subject, &scope_b).await.unwrap();

    assert_ne!(a.token_id, b.token_id);
    assert_eq!(a.status, TokenStatus::Active);
    assert_eq!(b.status, TokenStatus::Active);
}

#[tokio::test]
async fn concurrent_issuance_yields_one_live_token() {
    let (_, queue) = queue(1);
    let queue = Arc::new(queue);
    let scope = ScopeId::new();
    let subject = SubjectId::new();

    let contenders = 8;
    let barrier = Arc::new(tokio::sync::Barrier::new(contenders));
    let mut handles = Vec::new();
    for _ in 0..contenders {
        let queue = queue.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            queue.issue_token(&subject, &scope).await
        }));
    }

    let mut token_ids = std::collections::HashSet::new();
    for handle in handles {
        token_ids.insert(handle.await.unwrap().unwrap().token_id);
    }
    assert_eq!(token_ids.len(), 1);
}

#[tokio::test]
async fn expired_live_token_is_replaced_on_reissue() {
    let (clock, queue) = queue(1);
    let scope = ScopeId::new();
    let subject = SubjectId::new();

    let first = queue.issue_token(&subject, &scope).await.unwrap();
    assert_eq!(first.status, TokenStatus::Active);

    // Past the active TTL the old token no longer counts against capacity.
    clock.advance(chrono::Duration::seconds(601));
    let second = queue.issue_token(&subject, &scope).await.unwrap();
    assert_ne!(second.token_id, first.token_id);
    assert_eq!(second.status, TokenStatus::Active);

    assert!(matches!(
        queue.token_status(&subject, &first.token_id).await,
        Err(Error::Expired(_))
    ));
}

#[tokio::test]
async fn status_fails_once_the_deadline_has_passed() {
    let (clock, queue) = queue(1);
    let scope = ScopeId::new();
    let subject = SubjectId::new();

    let token = queue.issue_token(&subject, &scope).await.unwrap();
    clock.advance(chrono::Duration::seconds(601));

    // The sweeper has not repaired the stored status yet.
    assert!(matches!(
        queue.token_status(&subject, &token.token_id).await,
        Err(Error::Expired(_))
    ));
}

#[tokio::test]
async fn validation_rejects_everything_but_a_live_active_token() {
    let (clock, queue) = queue(1);
    let scope = ScopeId::new();
    let active = SubjectId::new();
    let waiting = SubjectId::new();

    let active_token = queue.issue_token(&active, &scope).await.unwrap();
    let waiting_token = queue.issue_token(&waiting, &scope).await.unwrap();

    queue
        .validate_active(&active, &scope, &active_token.token_id)
        .await
        .unwrap();

    assert!(matches!(
        queue.validate_active(&active, &scope, &TokenId::new()).await,
        Err(Error::Unauthorized(_))
    ));
    assert!(matches!(
        queue
            .validate_active(&waiting, &scope, &waiting_token.token_id)
            .await,
        Err(Error::Unauthorized(_))
    ));
    assert!(matches!(
        queue
            .validate_active(&waiting, &scope, &active_token.token_id)
            .await,
        Err(Error::Unauthorized(_))
    ));
    assert!(matches!(
        queue
            .validate_active(&active, &ScopeId::new(), &active_token.token_id)
            .await,
        Err(Error::Unauthorized(_))
    ));

    clock.advance(chrono::Duration::seconds(601));
    assert!(matches!(
        queue
            .validate_active(&active, &scope, &active_token.token_id)
            .await,
        Err(Error::Unauthorized(_))
    ));
}

#[tokio::test]
async fn completion_is_idempotent_and_guarded() {
    let (clock, queue) = queue(1);
    let scope = ScopeId::new();
    let issued = issue_spaced(&queue, &clock, &scope, 2).await;
    let (active, active_token) = issued[0];
    let (waiting, waiting_token) = issued[1];

    assert!(matches!(
        queue.complete_token(&waiting, &waiting_token).await,
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        queue.complete_token(&waiting, &active_token).await,
        Err(Error::Unauthorized(_))
    ));

    queue.complete_token(&active, &active_token).await.unwrap();
    queue.complete_token(&active, &active_token).await.unwrap();

    assert!(matches!(
        queue.complete_token(&active, &TokenId::new()).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn administrative_expiry_backfills_the_slot() {
    let (clock, queue) = queue(1);
    let scope = ScopeId::new();
    let issued = issue_spaced(&queue, &clock, &scope, 2).await;

    queue.expire_token(&issued[0].1).await.unwrap();
    // Expiring an already terminal token is a no-op.
    queue.expire_token(&issued[0].1).await.unwrap();

    let promoted = queue.token_status(&issued[1].0, &issued[1].1).await.unwrap();
    assert_eq!(promoted.status, TokenStatus::Active);
}

#[tokio::test]
async fn token_status_is_private_to_its_subject() {
    let (_, queue) = queue(1);
    let scope = ScopeId::new();
    let subject = SubjectId::new();
    let token = queue.issue_token(&subject, &scope).await.unwrap();

    assert!(matches!(
        queue.token_status(&SubjectId::new(), &token.token_id).await,
        Err(Error::Unauthorized(_))
    ));
    assert!(matches!(
        queue.token_status(&subject, &TokenId::new()).await,
        Err(Error::NotFound(_))
    ));
}
