//! Per-key idempotency state machine.
//!
//! # Architecture
//!
//! Records are stored under `{namespace}:idempotency:{key}` as JSON-encoded
//! [`IdempotencyRecord`]s:
//!
//! ```text
//!            start_operation (SET NX)
//!   absent ───────────────────────────► processing
//!                                          │    │
//!                     complete_operation   │    │  fail_operation
//!                                          ▼    ▼
//!                                  completed    failed ──► (re-claim)
//! ```
//!
//! - **Claim**: `set_if_absent` decides the single winner among concurrent callers
//! - **Self-healing**: a claimant that crashes leaves a processing record that
//!   simply expires after `processing_ttl`; there is no lease renewal
//! - **Re-claim of failures**: contenders race on a per-generation retry lock
//!   so exactly one of them takes over a failed record
//!
//! # Failure semantics
//!
//! - [`IdempotencyService::check_idempotency`] fails **open**: a store error
//!   yields [`IdempotencyCheck::New`]
//! - [`IdempotencyService::start_operation`] fails **closed**: a store error
//!   propagates, a claim is never granted without the store's cooperation

use crate::metrics::IdempotencyMetrics;
use chrono::{DateTime, Utc};
use idempotency_core::environment::{Clock, SystemClock};
use idempotency_core::{
    ClaimOutcome, IdempotencyCheck, IdempotencyConfig, IdempotencyError, IdempotencyRecord,
    KeyValueStore, OperationStatus,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Result type alias for idempotency operations.
pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// Compute the absolute expiry of a record written now with `ttl`.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Claim / complete / fail / replay over a shared [`KeyValueStore`].
///
/// # Thread Safety
///
/// This type is `Clone` and can be safely shared across tasks. Clones share the
/// store handle, configuration and clock.
///
/// # Example
///
/// ```
/// use idempotency_core::{ClaimOutcome, IdempotencyCheck, IdempotencyConfig};
/// use idempotency_runtime::IdempotencyService;
/// use idempotency_testing::InMemoryStore;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let service = IdempotencyService::new(InMemoryStore::new(), IdempotencyConfig::default());
///
/// let key = "create-reservation-42";
/// assert_eq!(service.start_operation(key, "corr-1", "msg-1", None).await?, ClaimOutcome::New);
/// service.complete_operation(key, &json!({"reservationId": "r1"}), None).await?;
///
/// assert_eq!(service.check_idempotency(key).await, IdempotencyCheck::Completed);
/// # Ok(())
/// # }
/// ```
pub struct IdempotencyService<S> {
    store: S,
    config: Arc<IdempotencyConfig>,
    clock: Arc<dyn Clock>,
}

impl<S: Clone> Clone for IdempotencyService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> std::fmt::Debug for IdempotencyService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> IdempotencyService<S> {
    /// Create a service on the system clock.
    #[must_use]
    pub fn new(store: S, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests drive time through a manual clock).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// The underlying store handle.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    async fn load(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let bytes = self.store.get(&self.config.record_key(key)).await?;
        Ok(bytes
            .map(|bytes| IdempotencyRecord::from_bytes(&bytes))
            .transpose()?)
    }

    async fn save(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<()> {
        self.store
            .set(&self.config.record_key(&record.key), record.to_bytes()?, ttl)
            .await?;
        Ok(())
    }

    /// Read-only check of a key.
    ///
    /// Absent (or failed) → `New`, processing → `Duplicate`, completed →
    /// `Completed`. Store and decoding errors are logged and reported as `New`:
    /// a subsequent claim still goes through the atomic write, so failing open
    /// here never grants a second execution by itself.
    pub async fn check_idempotency(&self, key: &str) -> IdempotencyCheck {
        match self.load(key).await {
            Ok(record) => {
                let check = IdempotencyCheck::from(record.as_ref());
                IdempotencyMetrics::record_check(check);
                tracing::debug!(key = key, outcome = ?check, "Idempotency check");
                check
            }
            Err(e) => {
                IdempotencyMetrics::record_store_error("check");
                tracing::warn!(
                    key = key,
                    error = %e,
                    "Idempotency check failed, treating key as new (fail open)"
                );
                IdempotencyCheck::New
            }
        }
    }

    /// Atomically claim a key by writing a processing record.
    ///
    /// Exactly one concurrent caller observes [`ClaimOutcome::New`]; everyone
    /// else observes [`ClaimOutcome::Duplicate`]. A key held by a failed record
    /// can be re-claimed by exactly one contender; the new processing record
    /// carries the failure count forward.
    ///
    /// `ttl` defaults to the configured `processing_ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the store cannot perform the claim. The
    /// caller must not execute the operation in that case.
    pub async fn start_operation(
        &self,
        key: &str,
        correlation_id: &str,
        message_id: &str,
        ttl: Option<Duration>,
    ) -> Result<ClaimOutcome> {
        let ttl = ttl.unwrap_or(self.config.processing_ttl);
        let now = self.clock.now();
        let mut record =
            IdempotencyRecord::processing(key, correlation_id, message_id, now, expiry(now, ttl));
        let record_key = self.config.record_key(key);

        let outcome = if self.claim(&record_key, &record, ttl).await? {
            ClaimOutcome::New
        } else {
            match self.load(key).await.inspect_err(|_| {
                IdempotencyMetrics::record_store_error("claim");
            })? {
                // Expired between the two round-trips: one more atomic attempt.
                None => {
                    if self.claim(&record_key, &record, ttl).await? {
                        ClaimOutcome::New
                    } else {
                        ClaimOutcome::Duplicate
                    }
                }
                Some(existing) if existing.status == OperationStatus::Failed => {
                    record.retry_count = existing.retry_count;
                    self.reclaim_failed(&record, &existing, ttl).await?
                }
                Some(_) => ClaimOutcome::Duplicate,
            }
        };

        IdempotencyMetrics::record_claim(outcome);
        match outcome {
            ClaimOutcome::New => tracing::debug!(
                key = key,
                correlation_id = correlation_id,
                message_id = message_id,
                "Claimed idempotency key"
            ),
            ClaimOutcome::Duplicate => tracing::info!(
                key = key,
                correlation_id = correlation_id,
                message_id = message_id,
                "Idempotency key already claimed"
            ),
        }
        Ok(outcome)
    }

    async fn claim(&self, record_key: &str, record: &IdempotencyRecord, ttl: Duration) -> Result<bool> {
        self.store
            .set_if_absent(record_key, record.to_bytes()?, ttl)
            .await
            .map_err(|e| {
                IdempotencyMetrics::record_store_error("claim");
                tracing::error!(
                    key = %record.key,
                    error = %e,
                    "Idempotency claim failed (fail closed)"
                );
                e.into()
            })
    }

    /// Take over a failed record. Only the contender that wins the retry lock
    /// for this failure generation overwrites the record.
    async fn reclaim_failed(
        &self,
        record: &IdempotencyRecord,
        failed: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<ClaimOutcome> {
        let lock_key = self.config.retry_lock_key(&record.key, failed.retry_count);
        let won = self
            .store
            .set_if_absent(
                &lock_key,
                record.message_id.clone().into_bytes(),
                self.config.failed_ttl,
            )
            .await?;
        if !won {
            return Ok(ClaimOutcome::Duplicate);
        }

        // The failed record may have expired and been claimed afresh since it
        // was read. Only overwrite the generation the lock was taken for.
        match self.load(&record.key).await? {
            Some(current)
                if current.status == OperationStatus::Failed
                    && current.retry_count == failed.retry_count => {}
            Some(_) => {
                tracing::info!(
                    key = %record.key,
                    "Failed record replaced before takeover, yielding"
                );
                return Ok(ClaimOutcome::Duplicate);
            }
            None => {
                let record_key = self.config.record_key(&record.key);
                return Ok(if self.claim(&record_key, record, ttl).await? {
                    ClaimOutcome::New
                } else {
                    ClaimOutcome::Duplicate
                });
            }
        }

        self.save(record, ttl).await?;
        tracing::info!(
            key = %record.key,
            retry_count = record.retry_count,
            previous_error = failed.error.as_deref().unwrap_or(""),
            "Re-claimed failed idempotency key"
        );
        Ok(ClaimOutcome::New)
    }

    /// Mark a claimed operation as completed and cache its result.
    ///
    /// The record is rewritten with `ttl` (default: `completed_ttl`). A later
    /// completion overwrites the cached result (last write wins). If no record
    /// exists, or the record has already failed, the call is logged and
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the result cannot be encoded or the
    /// store write fails.
    pub async fn complete_operation<T>(&self, key: &str, result: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let ttl = ttl.unwrap_or(self.config.completed_ttl);
        let value = serde_json::to_value(result)?;

        let Some(mut record) = self.load(key).await? else {
            tracing::warn!(key = key, "complete_operation without a claim, ignoring");
            return Ok(());
        };
        if record.status == OperationStatus::Failed {
            tracing::warn!(
                key = key,
                message_id = %record.message_id,
                "complete_operation on a failed record, ignoring"
            );
            return Ok(());
        }

        record.status = OperationStatus::Completed;
        record.result = Some(value);
        record.error = None;
        record.expires_at = expiry(self.clock.now(), ttl);
        self.save(&record, ttl).await?;

        IdempotencyMetrics::record_completion();
        tracing::debug!(
            key = key,
            message_id = %record.message_id,
            "Completed idempotent operation"
        );
        Ok(())
    }

    /// Mark a claimed operation as failed and increment its retry count.
    ///
    /// The record is rewritten with `ttl` (default: `failed_ttl`). If no record
    /// exists, or the record is completed, the call is logged and ignored: a
    /// cached result is never replaced by a failure.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the store write fails.
    pub async fn fail_operation(&self, key: &str, error: &str, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.config.failed_ttl);

        let Some(mut record) = self.load(key).await? else {
            tracing::warn!(key = key, "fail_operation without a claim, ignoring");
            return Ok(());
        };
        if record.status == OperationStatus::Completed {
            tracing::warn!(
                key = key,
                message_id = %record.message_id,
                error = error,
                "fail_operation on a completed record, ignoring"
            );
            return Ok(());
        }

        record.status = OperationStatus::Failed;
        record.error = Some(error.to_string());
        record.retry_count = record.retry_count.saturating_add(1);
        record.expires_at = expiry(self.clock.now(), ttl);
        self.save(&record, ttl).await?;

        IdempotencyMetrics::record_failure();
        tracing::info!(
            key = key,
            retry_count = record.retry_count,
            error = error,
            "Failed idempotent operation"
        );
        Ok(())
    }

    /// The cached result of a completed operation, `None` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the store read fails. Replays never
    /// fail open.
    pub async fn get_operation_result(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .load(key)
            .await?
            .filter(IdempotencyRecord::is_completed)
            .and_then(|record| record.result))
    }

    /// The cached result decoded into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the store read fails or the cached
    /// payload does not decode as `T`.
    pub async fn get_operation_result_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_operation_result(key)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// The full record of a key, whatever its status.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the store read fails.
    pub async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.load(key).await
    }

    /// Remove the record of a key, making it immediately claimable again.
    ///
    /// This is an operator action; the normal path relies on TTL expiry.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the store delete fails.
    pub async fn clear_operation(&self, key: &str) -> Result<()> {
        self.store.delete(&self.config.record_key(key)).await?;
        tracing::info!(key = key, "Cleared idempotency record");
        Ok(())
    }
}
