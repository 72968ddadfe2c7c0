//! Idempotent processing of inbound events.
//!
//! Handler authors implement [`EventHandler::process_event`] with their domain
//! logic; [`handle_with_idempotency`] runs the fixed algorithm around it:
//!
//! 1. Resolve the event context and idempotency key (overridable hooks)
//! 2. Completed key: return [`ProcessOutcome::AlreadyCompleted`]
//! 3. Key in flight elsewhere: return [`ProcessOutcome::DuplicateInFlight`]
//! 4. Otherwise claim, record the chain entry, process, and record the outcome
//!
//! Handler failures are returned after being recorded, tagged with the
//! [`EventHandler::should_retry`] classification so that an upstream retry or
//! dead-letter mechanism can act on them.
//!
//! # Example
//!
//! ```
//! use idempotency_core::{EventContext, EventEnvelope, HandlerError, IdempotencyConfig};
//! use idempotency_runtime::{
//!     CorrelationService, EventHandler, EventProcessor, IdempotencyService, ProcessOutcome,
//!     handle_with_idempotency,
//! };
//! use idempotency_testing::InMemoryStore;
//! use serde_json::json;
//!
//! struct SeatHeldHandler;
//!
//! impl EventHandler for SeatHeldHandler {
//!     fn service_name(&self) -> &str {
//!         "notifications"
//!     }
//!
//!     async fn process_event(&self, _event: &EventEnvelope, _ctx: &EventContext) -> Result<(), HandlerError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! let config = IdempotencyConfig::default();
//! let processor = EventProcessor::new(
//!     IdempotencyService::new(store.clone(), config.clone()),
//!     CorrelationService::new(store, config),
//! );
//!
//! let event = EventEnvelope::new("SeatHeld", json!({"seat": "A1"})).with_message_id("msg-1");
//! assert_eq!(handle_with_idempotency(&processor, &SeatHeldHandler, &event).await?, ProcessOutcome::Processed);
//! assert_eq!(handle_with_idempotency(&processor, &SeatHeldHandler, &event).await?, ProcessOutcome::AlreadyCompleted);
//! # Ok(())
//! # }
//! ```

use crate::correlation::CorrelationService;
use crate::guard::{GuardError, GuardOutcome, RequestGuard};
use crate::idempotency::IdempotencyService;
use idempotency_core::{
    EventContext, EventEnvelope, HandlerError, IdempotencyError, KeyValueStore,
    compose_idempotency_key,
};
use serde_json::json;
use std::future::Future;
use thiserror::Error;
use tracing::Instrument;

/// Outcome of [`handle_with_idempotency`] when nothing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The event was processed by this call.
    Processed,
    /// The event had already been processed; domain logic did not run.
    AlreadyCompleted,
    /// Another instance is processing the event; domain logic did not run.
    DuplicateInFlight,
}

/// Failure of [`handle_with_idempotency`].
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The claim could not be performed; the event was not processed.
    ///
    /// Always safe to retry.
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    /// Domain logic failed. The failure has been recorded.
    #[error("{source}")]
    Handler {
        /// The handler's error.
        source: HandlerError,
        /// Advisory retry classification from [`EventHandler::should_retry`].
        retryable: bool,
    },
}

impl ProcessingError {
    /// Whether an upstream retry mechanism should redeliver the event.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Idempotency(_) => true,
            Self::Handler { retryable, .. } => *retryable,
        }
    }
}

/// Domain logic for one kind of event, plus its overridable hooks.
pub trait EventHandler: Send + Sync {
    /// Name of the service running this handler, recorded in event chains.
    fn service_name(&self) -> &str;

    /// Resolve the processing context of an event.
    ///
    /// The default reads the envelope's `context` and synthesizes missing ids.
    fn extract_context(&self, event: &EventEnvelope) -> EventContext {
        event.resolve_context(self.service_name())
    }

    /// Derive the idempotency key of an event.
    ///
    /// See [`default_idempotency_key`].
    fn idempotency_key(&self, _event: &EventEnvelope, context: &EventContext) -> String {
        default_idempotency_key(context)
    }

    /// Run the domain logic.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when processing fails; the failure is recorded
    /// and surfaced to the caller of [`handle_with_idempotency`].
    fn process_event(
        &self,
        event: &EventEnvelope,
        context: &EventContext,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;

    /// Classify a failure as retryable. Advisory only.
    ///
    /// See [`default_should_retry`].
    fn should_retry(&self, error: &HandlerError, context: &EventContext) -> bool {
        default_should_retry(error, context)
    }
}

/// `event-{messageId}` for events that carry a message id.
///
/// Events without one get a synthesized id that differs on every delivery, so
/// they are keyed on `event:{eventType}:{correlationId}:{timestamp_millis}`
/// instead.
#[must_use]
pub fn default_idempotency_key(context: &EventContext) -> String {
    if context.message_id_synthesized {
        let millis = context.timestamp.timestamp_millis().to_string();
        compose_idempotency_key([
            "event",
            context.event_type.as_str(),
            context.correlation_id.as_str(),
            millis.as_str(),
        ])
    } else {
        format!("event-{}", context.message_id)
    }
}

/// Never retry past the retry budget or on validation failures; retry
/// everything else.
#[must_use]
pub const fn default_should_retry(error: &HandlerError, context: &EventContext) -> bool {
    if context.retry_count >= context.max_retries {
        return false;
    }
    !error.is_validation()
}

/// Services used by [`handle_with_idempotency`].
pub struct EventProcessor<S> {
    guard: RequestGuard<S>,
    correlation: CorrelationService<S>,
}

impl<S: Clone> Clone for EventProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            correlation: self.correlation.clone(),
        }
    }
}

impl<S> std::fmt::Debug for EventProcessor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("guard", &self.guard)
            .field("correlation", &self.correlation)
            .finish()
    }
}

impl<S: KeyValueStore> EventProcessor<S> {
    /// Create a processor.
    #[must_use]
    pub const fn new(idempotency: IdempotencyService<S>, correlation: CorrelationService<S>) -> Self {
        Self {
            guard: RequestGuard::new(idempotency),
            correlation,
        }
    }

    /// The idempotency service.
    #[must_use]
    pub const fn idempotency(&self) -> &IdempotencyService<S> {
        self.guard.idempotency()
    }

    /// The correlation service.
    #[must_use]
    pub const fn correlation(&self) -> &CorrelationService<S> {
        &self.correlation
    }
}

/// Process `event` with `handler` at most once per idempotency key.
///
/// # Errors
///
/// - [`ProcessingError::Idempotency`] if the key could not be claimed
/// - [`ProcessingError::Handler`] if domain logic failed
pub async fn handle_with_idempotency<S, H>(
    processor: &EventProcessor<S>,
    handler: &H,
    event: &EventEnvelope,
) -> Result<ProcessOutcome, ProcessingError>
where
    S: KeyValueStore,
    H: EventHandler,
{
    let context = handler.extract_context(event);
    let key = handler.idempotency_key(event, &context);

    let span = tracing::info_span!(
        "handle_event",
        event_type = %context.event_type,
        service = %context.service,
        correlation_id = %context.correlation_id,
        message_id = %context.message_id,
        key = %key,
    );

    async {
        let outcome = processor
            .guard
            .execute(
                Some(&key),
                &context.correlation_id,
                &context.message_id,
                || async {
                    processor
                        .correlation
                        .record_event_chain(
                            &context.correlation_id,
                            &context.message_id,
                            context.causation_id.as_deref(),
                            &context.event_type,
                            &context.service,
                            None,
                        )
                        .await;
                    handler.process_event(event, &context).await?;
                    Ok::<_, HandlerError>(json!({
                        "processed": true,
                        "messageId": context.message_id,
                        "eventType": context.event_type,
                        "service": context.service,
                    }))
                },
            )
            .await;

        match outcome {
            Ok(GuardOutcome::Executed(_) | GuardOutcome::Untracked(_)) => {
                tracing::debug!("Event processed");
                Ok(ProcessOutcome::Processed)
            }
            Ok(GuardOutcome::Replayed(_)) => {
                tracing::info!("Event already processed, skipping");
                Ok(ProcessOutcome::AlreadyCompleted)
            }
            Ok(GuardOutcome::Rejected) => {
                tracing::info!("Event being processed by another instance, skipping");
                Ok(ProcessOutcome::DuplicateInFlight)
            }
            Err(GuardError::Idempotency(e)) => Err(ProcessingError::Idempotency(e)),
            Err(GuardError::Handler(error)) => {
                let retryable = handler.should_retry(&error, &context);
                tracing::warn!(
                    error = %error,
                    retry_count = context.retry_count,
                    retryable = retryable,
                    "Event processing failed"
                );
                Err(ProcessingError::Handler {
                    source: error,
                    retryable,
                })
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use idempotency_core::{IdempotencyConfig, OperationStatus};
    use idempotency_testing::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail_with: Option<HandlerError>,
    }

    impl CountingHandler {
        const fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        const fn failing(error: HandlerError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: Some(error),
            }
        }
    }

    impl EventHandler for CountingHandler {
        fn service_name(&self) -> &str {
            "inventory"
        }

        async fn process_event(&self, _: &EventEnvelope, _: &EventContext) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            }
        }
    }

    fn processor() -> EventProcessor<InMemoryStore> {
        let store = InMemoryStore::new();
        let config = IdempotencyConfig::new("test");
        EventProcessor::new(
            IdempotencyService::new(store.clone(), config.clone()),
            CorrelationService::new(store, config),
        )
    }

    fn seat_held() -> EventEnvelope {
        EventEnvelope::new("SeatHeld", json!({"seat": "A1"}))
            .with_correlation_id("corr-1")
            .with_message_id("msg-2")
            .with_causation_id("msg-1")
    }

    #[tokio::test]
    async fn processes_once_and_skips_redelivery() {
        let processor = processor();
        let handler = CountingHandler::ok();
        let event = seat_held();

        let first = handle_with_idempotency(&processor, &handler, &event).await.unwrap();
        let second = handle_with_idempotency(&processor, &handler, &event).await.unwrap();

        assert_eq!(first, ProcessOutcome::Processed);
        assert_eq!(second, ProcessOutcome::AlreadyCompleted);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completion_marker_is_cached_not_domain_result() {
        let processor = processor();
        handle_with_idempotency(&processor, &CountingHandler::ok(), &seat_held())
            .await
            .unwrap();

        let marker = processor
            .idempotency()
            .get_operation_result("event-msg-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker["processed"], json!(true));
        assert_eq!(marker["messageId"], json!("msg-2"));
    }

    #[tokio::test]
    async fn records_chain_entry_with_causation() {
        let processor = processor();
        handle_with_idempotency(&processor, &CountingHandler::ok(), &seat_held())
            .await
            .unwrap();

        let chain = processor.correlation().get_event_chain("corr-1").await;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].message_id, "msg-2");
        assert_eq!(chain[0].causation_id.as_deref(), Some("msg-1"));
        assert_eq!(chain[0].service, "inventory");
    }

    #[tokio::test]
    async fn in_flight_event_is_skipped() {
        let processor = processor();
        processor
            .idempotency()
            .start_operation("event-msg-2", "corr-1", "other", None)
            .await
            .unwrap();
        let handler = CountingHandler::ok();

        let outcome = handle_with_idempotency(&processor, &handler, &seat_held())
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::DuplicateInFlight);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(processor.correlation().get_event_chain("corr-1").await.is_empty());
    }

    #[tokio::test]
    async fn failure_is_recorded_and_reraised() {
        let processor = processor();
        let handler = CountingHandler::failing(HandlerError::Failed("db timeout".to_string()));

        let err = handle_with_idempotency(&processor, &handler, &seat_held())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(err, ProcessingError::Handler { source: HandlerError::Failed(_), .. }));
        let record = processor.idempotency().get_record("event-msg-2").await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Failed);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn validation_failure_is_not_retryable() {
        let processor = processor();
        let handler = CountingHandler::failing(HandlerError::Validation("unknown seat".to_string()));

        let err = handle_with_idempotency(&processor, &handler, &seat_held())
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
    }

    #[test]
    fn retry_budget_is_respected() {
        let error = HandlerError::Failed("timeout".to_string());
        let within = seat_held().with_retries(2, 3).resolve_context("svc");
        let exhausted = seat_held().with_retries(3, 3).resolve_context("svc");

        assert!(default_should_retry(&error, &within));
        assert!(!default_should_retry(&error, &exhausted));
        assert!(!default_should_retry(
            &HandlerError::Validation("bad".to_string()),
            &within
        ));
    }

    #[test]
    fn key_uses_message_id_when_present() {
        let ctx = seat_held().resolve_context("svc");
        assert_eq!(default_idempotency_key(&ctx), "event-msg-2");
    }

    #[test]
    fn key_without_message_id_is_deterministic() {
        let event = EventEnvelope::new("SeatHeld", json!({})).with_correlation_id("corr-1");

        let first = default_idempotency_key(&event.resolve_context("svc"));
        let second = default_idempotency_key(&event.resolve_context("svc"));

        assert_eq!(first, second);
        assert!(first.starts_with("event:SeatHeld:corr-1:"));
    }
}
