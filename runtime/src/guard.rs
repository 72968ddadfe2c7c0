//! The guard state machine shared by every boundary adapter.
//!
//! ```text
//!   no key ─────────────────────────────────────────────► NoKey (pass through)
//!   key ──► check ──completed──────────────────────────► Replay
//!             │    ──duplicate─────────────────────────► Blocked
//!             └─new──► Claiming ──lost──────────────────► Blocked
//!                          └─won──► Processing ──ok────► Completed
//!                                              └─err───► Failed
//! ```
//!
//! [`RequestGuard::execute`] runs one unit of work through this machine. The
//! HTTP layer, the message guard and the event template are thin adapters
//! mapping their transport onto it.

use crate::idempotency::IdempotencyService;
use crate::metrics::IdempotencyMetrics;
use idempotency_core::{ClaimOutcome, IdempotencyCheck, IdempotencyError, KeyValueStore};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::time::Instant;
use thiserror::Error;

/// States of a guarded unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardState {
    /// No idempotency key: untracked pass-through.
    NoKey,
    /// Attempting the atomic claim.
    Claiming,
    /// Claim won, handler running.
    Processing,
    /// Handler succeeded and the result was cached.
    Completed,
    /// Handler failed and the failure was recorded.
    Failed,
    /// Another caller owns the key.
    Blocked,
    /// Answered from a cached result.
    Replay,
}

/// Terminal outcome of a guarded unit of work that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome<T> {
    /// No key was supplied; the handler ran untracked.
    Untracked(T),
    /// The claim was won and the handler ran.
    Executed(T),
    /// The key was already completed; this is the cached result.
    Replayed(Value),
    /// Another caller holds the key.
    Rejected,
}

impl<T> GuardOutcome<T> {
    /// The terminal state this outcome corresponds to.
    #[must_use]
    pub const fn state(&self) -> GuardState {
        match self {
            Self::Untracked(_) => GuardState::NoKey,
            Self::Executed(_) => GuardState::Completed,
            Self::Replayed(_) => GuardState::Replay,
            Self::Rejected => GuardState::Blocked,
        }
    }
}

/// Failure of a guarded unit of work.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The claim or replay could not be performed; the handler did not run.
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    /// The handler ran and failed. The failure has been recorded.
    #[error("{0}")]
    Handler(E),
}

/// Runs handlers at most once per idempotency key.
///
/// # Example
///
/// ```
/// use idempotency_core::{HandlerError, IdempotencyConfig};
/// use idempotency_runtime::{GuardOutcome, IdempotencyService, RequestGuard};
/// use idempotency_testing::InMemoryStore;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let service = IdempotencyService::new(InMemoryStore::new(), IdempotencyConfig::default());
/// let guard = RequestGuard::new(service);
///
/// let first = guard
///     .execute(Some("k"), "corr-1", "msg-1", || async { Ok::<_, HandlerError>(json!({"id": 1})) })
///     .await?;
/// let second = guard
///     .execute(Some("k"), "corr-1", "msg-2", || async { Ok::<_, HandlerError>(json!({"id": 2})) })
///     .await?;
///
/// assert_eq!(first, GuardOutcome::Executed(json!({"id": 1})));
/// assert_eq!(second, GuardOutcome::Replayed(json!({"id": 1})));
/// # Ok(())
/// # }
/// ```
pub struct RequestGuard<S> {
    idempotency: IdempotencyService<S>,
}

impl<S> std::fmt::Debug for RequestGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGuard")
            .field("idempotency", &self.idempotency)
            .finish()
    }
}

impl<S: Clone> Clone for RequestGuard<S> {
    fn clone(&self) -> Self {
        Self {
            idempotency: self.idempotency.clone(),
        }
    }
}

impl<S: KeyValueStore> RequestGuard<S> {
    /// Create a guard over an idempotency service.
    #[must_use]
    pub const fn new(idempotency: IdempotencyService<S>) -> Self {
        Self { idempotency }
    }

    /// The wrapped idempotency service.
    #[must_use]
    pub const fn idempotency(&self) -> &IdempotencyService<S> {
        &self.idempotency
    }

    /// Run `handler` under the guard.
    ///
    /// - `key == None`: the handler runs untracked.
    /// - completed key: the cached result is returned, the handler does not run.
    /// - key held by another caller: [`GuardOutcome::Rejected`].
    /// - otherwise the key is claimed, the handler runs, and its outcome is
    ///   recorded before returning.
    ///
    /// Recording the outcome is best effort: if the store rejects the
    /// completion or failure write, the error is logged and the handler's own
    /// outcome is still returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`GuardError::Idempotency`] if the claim or replay read fails; the
    ///   handler did not run.
    /// - [`GuardError::Handler`] with the handler's own error.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: Option<&str>,
        correlation_id: &str,
        message_id: &str,
        handler: F,
    ) -> Result<GuardOutcome<T>, GuardError<E>>
    where
        T: Serialize,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(key) = key else {
            tracing::trace!(state = ?GuardState::NoKey, "Untracked operation");
            return handler().await.map(GuardOutcome::Untracked).map_err(GuardError::Handler);
        };

        match self.idempotency.check_idempotency(key).await {
            IdempotencyCheck::Completed => {
                if let Some(result) = self.idempotency.get_operation_result(key).await? {
                    IdempotencyMetrics::record_replay();
                    tracing::info!(
                        key = key,
                        correlation_id = correlation_id,
                        state = ?GuardState::Replay,
                        "Replaying cached result"
                    );
                    return Ok(GuardOutcome::Replayed(result));
                }
                // Expired or overwritten between check and read.
                tracing::debug!(key = key, "Completed record vanished, claiming");
            }
            IdempotencyCheck::Duplicate => {
                tracing::info!(
                    key = key,
                    correlation_id = correlation_id,
                    state = ?GuardState::Blocked,
                    "Operation already in flight"
                );
                return Ok(GuardOutcome::Rejected);
            }
            IdempotencyCheck::New => {}
        }

        tracing::trace!(key = key, state = ?GuardState::Claiming);
        let claim = self
            .idempotency
            .start_operation(key, correlation_id, message_id, None)
            .await?;
        if claim == ClaimOutcome::Duplicate {
            tracing::info!(
                key = key,
                correlation_id = correlation_id,
                state = ?GuardState::Blocked,
                "Lost idempotency claim"
            );
            return Ok(GuardOutcome::Rejected);
        }

        tracing::trace!(key = key, state = ?GuardState::Processing);
        let started = Instant::now();
        let outcome = handler().await;
        IdempotencyMetrics::record_execution(started.elapsed());

        match outcome {
            Ok(result) => {
                if let Err(e) = self.idempotency.complete_operation(key, &result, None).await {
                    tracing::error!(
                        key = key,
                        correlation_id = correlation_id,
                        error = %e,
                        "Failed to record completion, result will not be replayable"
                    );
                }
                tracing::debug!(key = key, state = ?GuardState::Completed);
                Ok(GuardOutcome::Executed(result))
            }
            Err(error) => {
                if let Err(e) = self
                    .idempotency
                    .fail_operation(key, &error.to_string(), None)
                    .await
                {
                    tracing::error!(
                        key = key,
                        correlation_id = correlation_id,
                        error = %e,
                        "Failed to record handler failure"
                    );
                }
                tracing::debug!(key = key, state = ?GuardState::Failed, error = %error);
                Err(GuardError::Handler(error))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use idempotency_core::{HandlerError, IdempotencyConfig, OperationStatus, StoreError};
    use idempotency_testing::{FaultyStore, InMemoryStore, StoreOperation};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard() -> RequestGuard<InMemoryStore> {
        RequestGuard::new(IdempotencyService::new(
            InMemoryStore::new(),
            IdempotencyConfig::new("test"),
        ))
    }

    fn counting(calls: &Arc<AtomicUsize>, value: Value) -> impl Future<Output = Result<Value, HandlerError>> {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    }

    #[tokio::test]
    async fn no_key_passes_through_every_time() {
        let guard = guard();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let outcome = guard
                .execute(None, "c", "m", || counting(&calls, json!(1)))
                .await
                .unwrap();
            assert_eq!(outcome.state(), GuardState::NoKey);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn completed_key_replays_without_running_handler() {
        let guard = guard();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = guard
            .execute(Some("k"), "c", "m1", || counting(&calls, json!({"reservationId": "r1"})))
            .await
            .unwrap();
        let second = guard
            .execute(Some("k"), "c", "m2", || counting(&calls, json!({"reservationId": "r2"})))
            .await
            .unwrap();

        assert_eq!(first.state(), GuardState::Completed);
        assert_eq!(second, GuardOutcome::Replayed(json!({"reservationId": "r1"})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_result_is_replayed() {
        let guard = guard();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = guard
            .execute(Some("k"), "c", "m1", || counting(&calls, Value::Null))
            .await
            .unwrap();
        let second = guard
            .execute(Some("k"), "c", "m2", || counting(&calls, Value::Null))
            .await
            .unwrap();

        assert_eq!(first, GuardOutcome::Executed(Value::Null));
        assert_eq!(second, GuardOutcome::Replayed(Value::Null));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_key_is_rejected() {
        let guard = guard();
        guard
            .idempotency()
            .start_operation("k", "c", "owner", None)
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = guard
            .execute(Some("k"), "c", "m", || counting(&calls, json!(1)))
            .await
            .unwrap();

        assert_eq!(outcome, GuardOutcome::Rejected);
        assert_eq!(outcome.state(), GuardState::Blocked);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_failure_is_recorded_and_surfaced() {
        let guard = guard();

        let err = guard
            .execute(Some("k"), "c", "m", || async {
                Err::<Value, _>(HandlerError::Failed("seat map unavailable".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GuardError::Handler(HandlerError::Failed(_))));
        let record = guard.idempotency().get_record("k").await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.error.unwrap().contains("seat map unavailable"));
    }

    #[tokio::test]
    async fn failed_key_runs_again_on_retry() {
        let guard = guard();
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = guard
            .execute(Some("k"), "c", "m1", || async {
                Err::<Value, _>(HandlerError::Failed("transient".to_string()))
            })
            .await;

        let outcome = guard
            .execute(Some("k"), "c", "m2", || counting(&calls, json!("ok")))
            .await
            .unwrap();

        assert_eq!(outcome, GuardOutcome::Executed(json!("ok")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn claim_store_failure_does_not_run_handler() {
        let store = FaultyStore::new(InMemoryStore::new());
        let guard = RequestGuard::new(IdempotencyService::new(
            store.clone(),
            IdempotencyConfig::new("test"),
        ));
        store.fail(StoreOperation::SetIfAbsent);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = guard
            .execute(Some("k"), "c", "m", || counting(&calls, json!(1)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GuardError::Idempotency(IdempotencyError::Store(StoreError::Unavailable(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn completion_write_failure_keeps_handler_result() {
        let store = FaultyStore::new(InMemoryStore::new());
        let guard = RequestGuard::new(IdempotencyService::new(
            store.clone(),
            IdempotencyConfig::new("test"),
        ));

        let outcome = guard
            .execute(Some("k"), "c", "m", || {
                store.fail(StoreOperation::Set);
                async { Ok::<_, HandlerError>(json!({"id": 9})) }
            })
            .await
            .unwrap();

        assert_eq!(outcome, GuardOutcome::Executed(json!({"id": 9})));
    }
}
