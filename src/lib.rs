//! Admission control and resource concurrency engine.
//!
//! Mediates many concurrent subjects competing for strictly limited
//! resources: a waiting-queue token lifecycle decides who may act at all,
//! and three interchangeable concurrency strategies decide how mutations on
//! seats and balances defend against races. A distributed lock narrows
//! conflict windows across processes, a look-aside cache absorbs read
//! traffic, and a background sweeper reclaims lapsed holds and overdue
//! tokens.
//!
//! Correctness never depends on the lock or the cache: every mutation is a
//! conditional update judged by the record store itself.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use turnstile::{
//!     AdmissionQueue, ConditionalStrategy, Config, Engine, MemoryKeyValueStore, MemoryStore,
//!     SystemClock, ViewCache,
//! };
//!
//! # async fn demo() -> turnstile::Result<()> {
//! let config = Config::from_env();
//! let clock = Arc::new(SystemClock);
//! let store = Arc::new(MemoryStore::new());
//! let kv = Arc::new(MemoryKeyValueStore::new(clock.clone()));
//! let cache = Arc::new(ViewCache::new(kv, config.cache.clone()));
//!
//! let queue = AdmissionQueue::new(store.clone(), cache.clone(), clock.clone(), config.queue);
//! let engine = Engine::new(
//!     store,
//!     Arc::new(ConditionalStrategy::new()),
//!     cache,
//!     clock,
//!     config.engine,
//! );
//!
//! let subject = turnstile::SubjectId::new();
//! let scope = turnstile::ScopeId::new();
//! let token = queue.issue_token(&subject, &scope).await?;
//! queue.validate_active(&subject, &scope, &token.token_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod kv;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod sweeper;
pub mod types;

pub use cache::ViewCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, Config, EngineConfig, LockConfig, PostgresConfig, QueueConfig, RedisConfig,
    SweeperConfig,
};
pub use engine::{
    ConcurrencyStrategy, ConditionalStrategy, Engine, OptimisticStrategy, PessimisticStrategy,
};
pub use error::{Error, Result};
pub use kv::{KeyValueStore, MemoryKeyValueStore, RedisKeyValueStore};
pub use lock::{DistributedLock, LockGuard};
pub use queue::AdmissionQueue;
pub use store::{BalanceStore, MemoryStore, PostgresStore, SeatStore, Store, TokenStore};
pub use sweeper::ExpirySweeper;
pub use types::{
    Balance, BalanceEntry, BalanceEntryKind, BalanceView, QueueToken, ReservationView, ScopeId,
    Seat, SeatStatus, SubjectId, TokenId, TokenStatus, TokenView, UnitId,
};
