//! Distributed lock behavior under real task concurrency: mutual exclusion,
//! watchdog renewal past the lease, and crash recovery via lapse.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use turnstile::{
    DistributedLock, Error, KeyValueStore, LockConfig, ManualClock, MemoryKeyValueStore,
    SystemClock,
};

fn lock_over(store: Arc<MemoryKeyValueStore>, lease_ms: u64) -> DistributedLock {
    DistributedLock::new(
        store,
        LockConfig {
            wait_timeout_ms: 2000,
            lease_ms,
            poll_interval_ms: 5,
            slow_section_warn_ms: 10_000,
        },
    )
}

#[tokio::test]
async fn critical_sections_never_overlap() {
    let store = Arc::new(MemoryKeyValueStore::new(Arc::new(SystemClock)));
    let lock = Arc::new(lock_over(store, 60_000));

    let in_section = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..6 {
        let lock = lock.clone();
        let in_section = in_section.clone();
        let overlaps = overlaps.clone();
        handles.push(tokio::spawn(async move {
            let guard = lock.acquire("section").await.unwrap();
            if in_section.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            in_section.store(false, Ordering::SeqCst);
            guard.release().await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn watchdog_outlives_the_initial_lease() {
    let store = Arc::new(MemoryKeyValueStore::new(Arc::new(SystemClock)));
    let lock = lock_over(store, 100);

    // Hold the guard for several lease lengths; renewal keeps it ours.
    let guard = lock.acquire("long-section").await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;

    let contender = lock
        .acquire_with(
            "long-section",
            Duration::from_millis(50),
            Duration::from_secs(60),
        )
        .await;
    assert!(matches!(contender, Err(Error::Timeout(_))));

    guard.release().await;
    let next = lock.acquire("long-section").await.unwrap();
    next.release().await;
}

#[tokio::test]
async fn a_lapsed_lease_is_recoverable() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryKeyValueStore::new(clock.clone()));
    let lock = lock_over(store.clone(), 60_000);

    // A holder that stopped renewing (crashed process) leaves only its
    // lease behind.
    store
        .set("orphaned", "dead-owner", Duration::from_secs(3))
        .await
        .unwrap();
    assert!(matches!(
        lock.acquire_with("orphaned", Duration::from_millis(30), Duration::from_secs(60))
            .await,
        Err(Error::Timeout(_))
    ));

    clock.advance(chrono::Duration::seconds(4));
    let guard = lock.acquire("orphaned").await.unwrap();
    guard.release().await;
    assert_eq!(store.get("orphaned").await.unwrap(), None);
}
