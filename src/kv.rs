//! Shared key-value store contract backing the cache and the distributed
//! lock.
//!
//! The contract is deliberately small: get/set/delete with TTL plus the
//! compare-and-set / compare-and-delete primitives a lease needs. The Redis
//! implementation is the production backing; the in-memory implementation
//! satisfies the same contract for tests and local development.

use crate::clock::Clock;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Key-value store with TTLs and the lease primitives the lock layer needs.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the backing store fails.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with a TTL.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the backing store fails.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the backing store fails.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Store `value` only if the key is absent (lease acquisition). Returns
    /// whether the write happened.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the backing store fails.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remove the key only if it currently holds `value` (lease release).
    /// Returns whether a removal happened.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the backing store fails.
    async fn delete_if_matches(&self, key: &str, value: &str) -> Result<bool>;

    /// Reset the TTL only if the key currently holds `value` (lease
    /// renewal). Returns whether the extension happened.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the backing store fails.
    async fn extend_if_matches(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remove every key starting with `prefix`. Returns how many were
    /// removed. Used by the administrative evict-all operation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the backing store fails.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64>;
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Lua: delete the key only when it still holds the expected value.
const DELETE_IF_MATCHES: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end";

/// Lua: reset the TTL only when the key still holds the expected value.
const EXTEND_IF_MATCHES: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end";

/// Redis-backed [`KeyValueStore`] using a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisKeyValueStore {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the client cannot be
    /// created or the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub const fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[allow(clippy::cast_possible_truncation)] // TTLs fit far below u64::MAX ms
#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.pset_ex(key, value, ttl.as_millis() as u64).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_matches(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(DELETE_IF_MATCHES)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn extend_if_matches(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = redis::Script::new(EXTEND_IF_MATCHES)
            .key(key)
            .arg(value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended > 0)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let count: u64 = conn.del(keys).await?;
                removed += count;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

type Entry = (String, Option<DateTime<Utc>>);

/// In-memory [`KeyValueStore`] with clock-driven TTLs.
///
/// TTLs are evaluated lazily against the injected [`Clock`], so tests can
/// advance time manually instead of sleeping.
pub struct MemoryKeyValueStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn deadline(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }

    fn live<'a>(entry: Option<&'a Entry>, now: DateTime<Utc>) -> Option<&'a String> {
        match entry {
            Some((value, deadline)) if deadline.is_none_or(|d| now < d) => Some(value),
            _ => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(Self::live(entries.get(key), self.clock.now()).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let deadline = self.deadline(ttl);
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let deadline = self.deadline(ttl);
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if Self::live(entries.get(key), now).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), deadline));
        Ok(true)
    }

    async fn delete_if_matches(&self, key: &str, value: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let matches = Self::live(entries.get(key), now).is_some_and(|v| v == value);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn extend_if_matches(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let deadline = self.deadline(ttl);
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let matches = Self::live(entries.get(key), now).is_some_and(|v| v == value);
        if matches {
            if let Some(entry) = entries.get_mut(key) {
                entry.1 = deadline;
            }
        }
        Ok(matches)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryKeyValueStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryKeyValueStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn set_then_get() {
        let (_, store) = store();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn entries_expire_with_the_clock() {
        let (clock, store) = store();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();
        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_respects_live_entries_only() {
        let (clock, store) = store();
        assert!(store
            .set_if_absent("k", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("k", "b", Duration::from_secs(5))
            .await
            .unwrap());

        // An expired entry no longer blocks acquisition.
        clock.advance(chrono::Duration::seconds(6));
        assert!(store
            .set_if_absent("k", "b", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("b".to_string()));
    }

    #[tokio::test]
    async fn delete_if_matches_only_removes_own_value() {
        let (_, store) = store();
        store.set("k", "owner-1", Duration::from_secs(5)).await.unwrap();
        assert!(!store.delete_if_matches("k", "owner-2").await.unwrap());
        assert!(store.delete_if_matches("k", "owner-1").await.unwrap());
        assert!(!store.delete_if_matches("k", "owner-1").await.unwrap());
    }

    #[tokio::test]
    async fn extend_if_matches_renews_the_deadline() {
        let (clock, store) = store();
        store.set("k", "owner", Duration::from_secs(5)).await.unwrap();
        clock.advance(chrono::Duration::seconds(4));
        assert!(store
            .extend_if_matches("k", "owner", Duration::from_secs(5))
            .await
            .unwrap());
        clock.advance(chrono::Duration::seconds(4));
        assert_eq!(store.get("k").await.unwrap(), Some("owner".to_string()));
    }

    #[tokio::test]
    async fn delete_by_prefix_scopes_removal() {
        let (_, store) = store();
        store.set("app:a", "1", Duration::from_secs(5)).await.unwrap();
        store.set("app:b", "2", Duration::from_secs(5)).await.unwrap();
        store.set("other:c", "3", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.delete_by_prefix("app:").await.unwrap(), 2);
        assert_eq!(store.get("other:c").await.unwrap(), Some("3".to_string()));
    }
}
