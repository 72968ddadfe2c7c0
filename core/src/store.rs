//! Shared key-value store contract.
//!
//! This module defines the trait every backing store must implement. The
//! idempotency and correlation services never talk to a concrete backend; they
//! are generic over [`KeyValueStore`].
//!
//! # Implementation Notes
//!
//! - **CRITICAL**: `set_if_absent()` MUST be atomic (use `Redis` `SET NX EX`,
//!   a database unique constraint, or a mutex-protected check-and-insert).
//!   Exactly one concurrent caller may observe `true` for the same key.
//! - Expired keys must behave exactly like absent keys for every operation.
//! - Lists are append-only from the services' point of view; `list_range`
//!   follows `Redis` `LRANGE` index semantics (inclusive, negative indices
//!   count from the end).
//! - Implementations are cheap to clone (connection pool handle or `Arc`).
//!
//! # Implementations
//!
//! - `InMemoryStore` (`idempotency-testing`) - for tests, with a manual clock
//! - `RedisStore` (`idempotency-redis`) - for production

use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared key-value store with TTLs, atomic create-if-absent and lists.
///
/// Values are opaque bytes; the services encode records as JSON.
pub trait KeyValueStore: Clone + Send + Sync + 'static {
    /// Read a value. Returns `None` if the key is absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    fn get(&self, key: &str) -> impl Future<Output = StoreResult<Option<Vec<u8>>>> + Send;

    /// Write a value unconditionally, replacing any previous value and TTL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Atomically write a value only if the key is absent (or expired).
    ///
    /// Returns `true` if this call created the key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails. Callers must not treat an
    /// error as either outcome.
    fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Delete a key. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    fn delete(&self, key: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// Append a value to the list stored at `key`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the append fails.
    fn list_append(&self, key: &str, value: Vec<u8>)
    -> impl Future<Output = StoreResult<()>> + Send;

    /// Read the inclusive range `start..=stop` of the list at `key`.
    ///
    /// Negative indices count from the end (`-1` is the last element). An absent
    /// key yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> impl Future<Output = StoreResult<Vec<Vec<u8>>>> + Send;

    /// Set a TTL on an existing key. No-op if the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the command fails.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = StoreResult<()>> + Send;
}

/// Convert a TTL to whole seconds, rounding up, never below one second.
///
/// Stores with second-granularity expiry must never turn a short TTL into
/// "no expiry".
#[must_use]
pub fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    let rounded = if ttl.subsec_nanos() > 0 { secs + 1 } else { secs };
    rounded.max(1)
}
