//! In-memory key-value store testing utilities
//!
//! Provides fast, deterministic fakes of the shared store:
//! - [`InMemoryStore`]: HashMap-based store with TTLs driven by an injectable clock
//! - [`FaultyStore`]: wrapper that fails selected operations on demand

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::{DateTime, Utc};
use idempotency_core::environment::{Clock, SystemClock};
use idempotency_core::{KeyValueStore, StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    List(Vec<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// Resolve a `Redis`-style inclusive range against a list length.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

/// In-memory store for fast, deterministic testing.
///
/// Every operation takes one lock, so `set_if_absent` is atomic exactly like
/// `SET NX` on a real server. Expiry is evaluated against the injected
/// [`Clock`], which lets tests move time forward with a
/// [`ManualClock`](crate::ManualClock) instead of sleeping.
///
/// # Example
///
/// ```
/// use idempotency_testing::InMemoryStore;
/// use idempotency_core::KeyValueStore;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryStore::new();
///
/// assert!(store.set_if_absent("k", b"v".to_vec(), Duration::from_secs(60)).await?);
/// assert!(!store.set_if_absent("k", b"w".to_vec(), Duration::from_secs(60)).await?);
/// assert_eq!(store.get("k").await?, Some(b"v".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("keys", &self.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryStore {
    /// Create an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose expiry follows `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Clear all data (for test isolation).
    pub fn clear(&self) {
        self.data.write().unwrap().clear();
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.data
            .read()
            .unwrap()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether no live keys remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live key exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.data
            .read()
            .unwrap()
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Remaining time to live of a key, if it has one.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<chrono::Duration> {
        let now = self.clock.now();
        self.data
            .read()
            .unwrap()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now)
    }

    /// All live keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .data
            .read()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn purge_expired(data: &mut HashMap<String, Entry>, key: &str, now: DateTime<Utc>) {
        if data.get(key).is_some_and(|entry| !entry.is_live(now)) {
            data.remove(key);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = self.clock.now();
        let data = self.data.read().unwrap();
        match data.get(key).filter(|entry| entry.is_live(now)) {
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(StoreError::Backend(format!(
                "WRONGTYPE key {key} holds a list"
            ))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now();
        self.data.write().unwrap().insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value),
                expires_at: deadline(now, ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut data = self.data.write().unwrap();
        Self::purge_expired(&mut data, key, now);
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value),
                expires_at: deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    async fn list_append(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let now = self.clock.now();
        let mut data = self.data.write().unwrap();
        Self::purge_expired(&mut data, key, now);
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(items) => {
                items.push(value);
                Ok(())
            }
            Value::Bytes(_) => Err(StoreError::Backend(format!(
                "WRONGTYPE key {key} holds a value"
            ))),
        }
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<Vec<u8>>> {
        let now = self.clock.now();
        let data = self.data.read().unwrap();
        match data.get(key).filter(|entry| entry.is_live(now)) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(resolve_range(items.len(), start, stop)
                .map(|(from, to)| items[from..=to].to_vec())
                .unwrap_or_default()),
            Some(_) => Err(StoreError::Backend(format!(
                "WRONGTYPE key {key} holds a value"
            ))),
            None => Ok(Vec::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now();
        let mut data = self.data.write().unwrap();
        Self::purge_expired(&mut data, key, now);
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at = deadline(now, ttl);
        }
        Ok(())
    }
}

/// Operations of the store contract, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// `get`
    Get,
    /// `set`
    Set,
    /// `set_if_absent`
    SetIfAbsent,
    /// `delete`
    Delete,
    /// `list_append`
    ListAppend,
    /// `list_range`
    ListRange,
    /// `expire`
    Expire,
}

impl StoreOperation {
    const ALL: [Self; 7] = [
        Self::Get,
        Self::Set,
        Self::SetIfAbsent,
        Self::Delete,
        Self::ListAppend,
        Self::ListRange,
        Self::Expire,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

/// Store wrapper that returns [`StoreError::Unavailable`] for selected operations.
///
/// # Example
///
/// ```
/// use idempotency_testing::{FaultyStore, InMemoryStore, StoreOperation};
/// use idempotency_core::KeyValueStore;
///
/// # async fn example() {
/// let store = FaultyStore::new(InMemoryStore::new());
/// store.fail(StoreOperation::Get);
/// assert!(store.get("k").await.is_err());
///
/// store.heal();
/// assert!(store.get("k").await.is_ok());
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct FaultyStore {
    inner: InMemoryStore,
    failing: Arc<[AtomicBool; 7]>,
}

impl FaultyStore {
    /// Wrap a store; nothing fails until [`FaultyStore::fail`] is called.
    #[must_use]
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            failing: Arc::new(std::array::from_fn(|_| AtomicBool::new(false))),
        }
    }

    /// Make `operation` fail from now on.
    pub fn fail(&self, operation: StoreOperation) {
        self.failing[operation.index()].store(true, Ordering::SeqCst);
    }

    /// Make every operation fail.
    pub fn fail_all(&self) {
        for operation in StoreOperation::ALL {
            self.fail(operation);
        }
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        for flag in self.failing.iter() {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    fn check(&self, operation: StoreOperation) -> StoreResult<()> {
        if self.failing[operation.index()].load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!(
                "injected failure on {operation:?}"
            )))
        } else {
            Ok(())
        }
    }
}

impl KeyValueStore for FaultyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check(StoreOperation::Get)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        self.check(StoreOperation::Set)?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<bool> {
        self.check(StoreOperation::SetIfAbsent)?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check(StoreOperation::Delete)?;
        self.inner.delete(key).await
    }

    async fn list_append(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.check(StoreOperation::ListAppend)?;
        self.inner.list_append(key, value).await
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<Vec<u8>>> {
        self.check(StoreOperation::ListRange)?;
        self.inner.list_range(key, start, stop).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.check(StoreOperation::Expire)?;
        self.inner.expire(key, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_if_absent_is_single_winner() {
        let store = InMemoryStore::new();

        assert!(store.set_if_absent("k", b"a".to_vec(), MINUTE).await.unwrap());
        assert!(!store.set_if_absent("k", b"b".to_vec(), MINUTE).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn expired_keys_behave_as_absent() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryStore::with_clock(clock.clone());

        store.set("k", b"a".to_vec(), MINUTE).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.contains_key("k"));
        assert!(store.set_if_absent("k", b"b".to_vec(), MINUTE).await.unwrap());
    }

    #[tokio::test]
    async fn list_range_follows_redis_semantics() {
        let store = InMemoryStore::new();
        for item in ["a", "b", "c", "d"] {
            store.list_append("l", item.as_bytes().to_vec()).await.unwrap();
        }

        let all = store.list_range("l", 0, -1).await.unwrap();
        assert_eq!(all.len(), 4);

        let tail = store.list_range("l", -2, -1).await.unwrap();
        assert_eq!(tail, vec![b"c".to_vec(), b"d".to_vec()]);

        let past_end = store.list_range("l", 2, 100).await.unwrap();
        assert_eq!(past_end.len(), 2);

        assert!(store.list_range("l", 3, 1).await.unwrap().is_empty());
        assert!(store.list_range("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expire_applies_to_lists() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryStore::with_clock(clock.clone());

        store.list_append("l", b"a".to_vec()).await.unwrap();
        store.expire("l", MINUTE).await.unwrap();
        assert!(store.ttl("l").is_some());

        clock.advance(chrono::Duration::minutes(2));
        assert!(store.list_range("l", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_type_is_a_backend_error() {
        let store = InMemoryStore::new();
        store.set("k", b"a".to_vec(), MINUTE).await.unwrap();

        let err = store.list_append("k", b"b".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn faulty_store_injects_and_heals() {
        let store = FaultyStore::new(InMemoryStore::new());
        store.fail(StoreOperation::SetIfAbsent);

        let err = store
            .set_if_absent("k", b"a".to_vec(), MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.get("k").await.is_ok());

        store.heal();
        assert!(store.set_if_absent("k", b"a".to_vec(), MINUTE).await.unwrap());
    }
}
