//! Races through the three concurrency strategies: exactly one winner per
//! unit, never an overdraft, identical invariants whichever strategy runs.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use turnstile::{
    AdmissionQueue, CacheConfig, ConcurrencyStrategy, ConditionalStrategy, DistributedLock,
    Engine, EngineConfig, Error, KeyValueStore, LockConfig, ManualClock, MemoryKeyValueStore,
    MemoryStore, OptimisticStrategy, PessimisticStrategy, QueueConfig, ScopeId, SeatStatus,
    SubjectId, UnitId, ViewCache,
};

fn engine_with(strategy: Arc<dyn ConcurrencyStrategy>) -> (Arc<ManualClock>, Arc<Engine>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::new());
    let kv = Arc::new(MemoryKeyValueStore::new(clock.clone()));
    let cache = Arc::new(ViewCache::new(kv, CacheConfig::default()));
    let engine = Engine::new(store, strategy, cache, clock.clone(), EngineConfig::default());
    (clock, Arc::new(engine))
}

fn fast_optimistic() -> Arc<dyn ConcurrencyStrategy> {
    Arc::new(OptimisticStrategy::new(3, Duration::from_millis(5)))
}

fn all_strategies() -> Vec<Arc<dyn ConcurrencyStrategy>> {
    vec![
        Arc::new(ConditionalStrategy::new()),
        Arc::new(PessimisticStrategy::new()),
        fast_optimistic(),
    ]
}

async fn race_reserve(engine: Arc<Engine>, contenders: usize) -> Vec<Result<(), Error>> {
    let scope = ScopeId::new();
    let unit = UnitId::new();
    engine.add_seat(scope, unit).await.unwrap();

    let barrier = Arc::new(Barrier::new(contenders));
    let mut handles = Vec::new();
    for _ in 0..contenders {
        let engine = engine.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            let holder = SubjectId::new();
            barrier.wait().await;
            engine.reserve(&scope, &unit, &holder).await.map(|_| ())
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn exactly_one_contender_wins_the_unit() {
    for strategy in all_strategies() {
        let name = strategy.name();
        let (_, engine) = engine_with(strategy);
        let outcomes = race_reserve(engine, 8).await;

        let winners = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(winners, 1, "strategy {name}: expected exactly one winner");
        for outcome in outcomes {
            if let Err(err) = outcome {
                assert!(
                    matches!(err, Error::Conflict(_) | Error::BusyRetryExhausted { .. }),
                    "strategy {name}: unexpected loser error {err}"
                );
            }
        }
    }
}

#[tokio::test]
async fn concurrent_deductions_never_overdraw() {
    for strategy in all_strategies() {
        let name = strategy.name();
        let (_, engine) = engine_with(strategy);
        let subject = SubjectId::new();
        engine.open_balance(subject, 100).await.unwrap();

        let barrier = Arc::new(Barrier::new(5));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let engine = engine.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine.deduct(&subject, 30).await
            }));
        }

        let mut successes = 0u64;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        let balance = engine.balance(&subject).await.unwrap();
        assert!(successes <= 3, "strategy {name}: overdraft");
        assert_eq!(
            balance.amount,
            100 - 30 * successes,
            "strategy {name}: balance does not match committed deductions"
        );
    }
}

#[tokio::test]
async fn interleaved_credits_and_deductions_stay_consistent() {
    for strategy in all_strategies() {
        let name = strategy.name();
        let (_, engine) = engine_with(strategy);
        let subject = SubjectId::new();
        engine.open_balance(subject, 1000).await.unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let engine = engine.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                if i % 2 == 0 {
                    engine.deduct(&subject, 100).await.map(|_| -100i64)
                } else {
                    engine.credit(&subject, 50).await.map(|_| 50i64)
                }
            }));
        }

        let mut delta = 0i64;
        for handle in handles {
            if let Ok(change) = handle.await.unwrap() {
                delta += change;
            }
        }

        let balance = engine.balance(&subject).await.unwrap();
        assert_eq!(
            i64::try_from(balance.amount).unwrap(),
            1000 + delta,
            "strategy {name}: balance drifted from committed operations"
        );
    }
}

#[tokio::test]
async fn confirm_is_limited_to_the_holder() {
    for strategy in all_strategies() {
        let name = strategy.name();
        let (_, engine) = engine_with(strategy);
        let scope = ScopeId::new();
        let unit = UnitId::new();
        let holder = SubjectId::new();
        let stranger = SubjectId::new();
        engine.add_seat(scope, unit).await.unwrap();

        engine.reserve(&scope, &unit, &holder).await.unwrap();
        let stolen = engine.confirm(&scope, &unit, &stranger).await;
        assert!(
            matches!(stolen, Err(Error::Conflict(_))),
            "strategy {name}: stranger confirmed someone else's hold"
        );

        let sold = engine.confirm(&scope, &unit, &holder).await.unwrap();
        assert_eq!(sold.status, SeatStatus::Sold, "strategy {name}");

        let again = engine.reserve(&scope, &unit, &SubjectId::new()).await;
        assert!(
            matches!(again, Err(Error::Conflict(_))),
            "strategy {name}: sold unit was reserved again"
        );
    }
}

#[tokio::test]
async fn confirm_drops_the_cached_availability_view() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::new());
    let kv = Arc::new(MemoryKeyValueStore::new(clock.clone()));
    let cache = Arc::new(ViewCache::new(kv.clone(), CacheConfig::default()));
    let engine = Engine::new(
        store,
        Arc::new(ConditionalStrategy::new()),
        cache,
        clock.clone(),
        EngineConfig::default(),
    );

    let scope = ScopeId::new();
    let unit = UnitId::new();
    let holder = SubjectId::new();
    engine.add_seat(scope, unit).await.unwrap();
    engine.add_seat(scope, UnitId::new()).await.unwrap();
    engine.reserve(&scope, &unit, &holder).await.unwrap();

    let cache_key = format!("turnstile:availability:{scope}");
    engine.availability(&scope).await.unwrap();
    assert!(kv.get(&cache_key).await.unwrap().is_some());

    engine.confirm(&scope, &unit, &holder).await.unwrap();
    assert!(kv.get(&cache_key).await.unwrap().is_none());
}

#[tokio::test]
async fn two_large_deductions_cannot_both_land() {
    // 100_000 on the account, two concurrent 60_000 deductions: one wins,
    // one is refused, and exactly 40_000 remains.
    for strategy in all_strategies() {
        let name = strategy.name();
        let (_, engine) = engine_with(strategy);
        let subject = SubjectId::new();
        engine.open_balance(subject, 100_000).await.unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let engine = engine.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine.deduct(&subject, 60_000).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(
                    Error::InsufficientFunds { .. } | Error::BusyRetryExhausted { .. },
                ) => {}
                Err(err) => panic!("strategy {name}: unexpected error {err}"),
            }
        }

        assert_eq!(winners, 1, "strategy {name}");
        assert_eq!(engine.balance(&subject).await.unwrap().amount, 40_000);
    }
}

#[tokio::test]
async fn manual_release_reclaims_only_lapsed_holds() {
    let (clock, engine) = engine_with(Arc::new(ConditionalStrategy::new()));
    let scope = ScopeId::new();
    let unit = UnitId::new();
    engine.add_seat(scope, unit).await.unwrap();
    engine.reserve(&scope, &unit, &SubjectId::new()).await.unwrap();

    assert!(!engine.release(&scope, &unit).await.unwrap());
    clock.advance(chrono::Duration::seconds(301));
    assert!(engine.release(&scope, &unit).await.unwrap());
    assert!(!engine.release(&scope, &unit).await.unwrap());

    engine.reserve(&scope, &unit, &SubjectId::new()).await.unwrap();
}

#[tokio::test]
async fn audit_trail_records_every_committed_mutation() {
    let (_, engine) = engine_with(Arc::new(ConditionalStrategy::new()));
    let subject = SubjectId::new();
    engine.open_balance(subject, 500).await.unwrap();

    engine.deduct(&subject, 200).await.unwrap();
    engine.credit(&subject, 50).await.unwrap();
    let refused = engine.deduct(&subject, 1000).await;
    assert!(matches!(refused, Err(Error::InsufficientFunds { .. })));

    let entries = engine.balance_entries(&subject).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].balance_after, 300);
    assert_eq!(entries[1].balance_after, 350);
}

#[tokio::test]
async fn zero_amounts_are_rejected_before_any_store_access() {
    let (_, engine) = engine_with(Arc::new(ConditionalStrategy::new()));
    let subject = SubjectId::new();
    assert!(matches!(
        engine.deduct(&subject, 0).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        engine.credit(&subject, 0).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn distributed_lock_wrapped_engine_still_picks_one_winner() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::new());
    let kv = Arc::new(MemoryKeyValueStore::new(clock.clone()));
    let cache = Arc::new(ViewCache::new(kv.clone(), CacheConfig::default()));
    let lock = DistributedLock::new(
        kv,
        LockConfig {
            wait_timeout_ms: 2000,
            lease_ms: 60_000,
            poll_interval_ms: 5,
            slow_section_warn_ms: 10_000,
        },
    );
    let engine = Arc::new(
        Engine::new(
            store,
            Arc::new(ConditionalStrategy::new()),
            cache,
            clock,
            EngineConfig::default(),
        )
        .with_lock(lock),
    );

    let outcomes = race_reserve(engine.clone(), 4).await;
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);

    // The lock was released by every contender; an unrelated mutation on the
    // same engine proceeds without waiting out a lease.
    let subject = SubjectId::new();
    engine.open_balance(subject, 10).await.unwrap();
    engine.deduct(&subject, 10).await.unwrap();
}

#[tokio::test]
async fn active_token_gates_follow_the_queue() {
    // Reservation traffic in front of the engine goes through the queue;
    // only an admitted subject passes validation.
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::new());
    let kv = Arc::new(MemoryKeyValueStore::new(clock.clone()));
    let cache = Arc::new(ViewCache::new(kv, CacheConfig::default()));
    let queue = AdmissionQueue::new(
        store.clone(),
        cache.clone(),
        clock.clone(),
        QueueConfig {
            capacity: 1,
            ..QueueConfig::default()
        },
    );
    let engine = Engine::new(
        store,
        Arc::new(ConditionalStrategy::new()),
        cache,
        clock,
        EngineConfig::default(),
    );

    let scope = ScopeId::new();
    let unit = UnitId::new();
    engine.add_seat(scope, unit).await.unwrap();

    let admitted = SubjectId::new();
    let queued = SubjectId::new();
    let admitted_token = queue.issue_token(&admitted, &scope).await.unwrap();
    let queued_token = queue.issue_token(&queued, &scope).await.unwrap();

    queue
        .validate_active(&admitted, &scope, &admitted_token.token_id)
        .await
        .unwrap();
    assert!(matches!(
        queue
            .validate_active(&queued, &scope, &queued_token.token_id)
            .await,
        Err(Error::Unauthorized(_))
    ));

    engine.reserve(&scope, &unit, &admitted).await.unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn balance_never_goes_negative(
        initial in 0u64..10_000,
        amounts in prop::collection::vec(1u64..500, 1..20),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (_, engine) = engine_with(Arc::new(ConditionalStrategy::new()));
            let subject = SubjectId::new();
            engine.open_balance(subject, initial).await.unwrap();

            let mut expected = initial;
            for amount in amounts {
                match engine.deduct(&subject, amount).await {
                    Ok(view) => {
                        expected -= amount;
                        prop_assert_eq!(view.amount, expected);
                    }
                    Err(Error::InsufficientFunds { available, requested }) => {
                        prop_assert_eq!(available, expected);
                        prop_assert_eq!(requested, amount);
                        prop_assert!(amount > expected);
                    }
                    Err(err) => return Err(TestCaseError::fail(format!("unexpected error {err}"))),
                }
            }

            let balance = engine.balance(&subject).await.unwrap();
            prop_assert_eq!(balance.amount, expected);
            Ok(())
        })?;
    }
}
