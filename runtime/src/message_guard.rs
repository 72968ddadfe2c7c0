//! Guard for asynchronous, bidirectional messages.
//!
//! Messages are JSON objects. Three fields are recognised:
//!
//! - `idempotencyKey` (optional): enables deduplication
//! - `correlationId` (optional): synthesized when missing
//! - `messageId` (optional): synthesized when missing
//!
//! The resolved correlation and message ids are always written back into the
//! payload before the handler sees it. Short-circuits produce a synthetic
//! [`MessageReply`] for the sender instead of running the handler.
//!
//! Every message whose handler runs is appended to its correlation's event
//! chain. `causationId` links it to the message that caused it, and `type`
//! (default [`MESSAGE_EVENT`]) becomes the chain entry's event type.

use crate::correlation::CorrelationService;
use crate::guard::{GuardError, GuardOutcome, RequestGuard};
use idempotency_core::{
    HandlerError, KeyValueStore, MetadataUpdate, generate_correlation_id, generate_message_id,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;

/// Payload field carrying the idempotency key.
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotencyKey";
/// Payload field carrying the correlation id.
pub const CORRELATION_ID_FIELD: &str = "correlationId";
/// Payload field carrying the message id.
pub const MESSAGE_ID_FIELD: &str = "messageId";
/// Payload field naming the message that caused this one.
pub const CAUSATION_ID_FIELD: &str = "causationId";
/// Payload field naming the message type.
pub const MESSAGE_TYPE_FIELD: &str = "type";
/// Event type recorded for messages without a `type`.
pub const MESSAGE_EVENT: &str = "Message";

/// Reply sent back to the message's sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageReply {
    /// The handler ran.
    #[serde(rename_all = "camelCase")]
    Result {
        /// Correlation id of the message.
        correlation_id: String,
        /// Id of the message.
        message_id: String,
        /// Handler result.
        data: Value,
    },

    /// The key was already completed; `data` is the cached result.
    #[serde(rename_all = "camelCase")]
    AlreadyProcessed {
        /// Correlation id of the message.
        correlation_id: String,
        /// Id of the message.
        message_id: String,
        /// The deduplicated key.
        idempotency_key: String,
        /// Cached result of the first execution.
        data: Value,
    },

    /// Another instance is processing the key.
    #[serde(rename_all = "camelCase")]
    DuplicateInFlight {
        /// Correlation id of the message.
        correlation_id: String,
        /// Id of the message.
        message_id: String,
        /// The contended key.
        idempotency_key: String,
    },

    /// The message was malformed, the handler failed, or the store refused
    /// the claim.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Correlation id of the message.
        correlation_id: String,
        /// Id of the message.
        message_id: String,
        /// Human readable reason.
        message: String,
    },
}

impl MessageReply {
    /// Correlation id the reply refers to.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Result { correlation_id, .. }
            | Self::AlreadyProcessed { correlation_id, .. }
            | Self::DuplicateInFlight { correlation_id, .. }
            | Self::Error { correlation_id, .. } => correlation_id,
        }
    }

    /// Message id the reply refers to.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Result { message_id, .. }
            | Self::AlreadyProcessed { message_id, .. }
            | Self::DuplicateInFlight { message_id, .. }
            | Self::Error { message_id, .. } => message_id,
        }
    }
}

/// Message-oriented adapter over [`RequestGuard`].
pub struct MessageGuard<S> {
    guard: RequestGuard<S>,
    correlation: CorrelationService<S>,
    id_prefix: String,
    service: String,
}

impl<S: Clone> Clone for MessageGuard<S> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            correlation: self.correlation.clone(),
            id_prefix: self.id_prefix.clone(),
            service: self.service.clone(),
        }
    }
}

impl<S> std::fmt::Debug for MessageGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageGuard")
            .field("guard", &self.guard)
            .field("id_prefix", &self.id_prefix)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

fn non_empty_str<'a>(payload: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

impl<S: KeyValueStore> MessageGuard<S> {
    /// Create a message guard. Synthesized correlation ids use the `ws`
    /// prefix and executed messages are recorded under the service name `ws`.
    #[must_use]
    pub fn new(guard: RequestGuard<S>, correlation: CorrelationService<S>) -> Self {
        Self {
            guard,
            correlation,
            id_prefix: "ws".to_string(),
            service: "ws".to_string(),
        }
    }

    /// Service name recorded in event chains and correlation metadata.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Prefix for synthesized correlation ids.
    #[must_use]
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Run `handler` on a message under the guard.
    ///
    /// The handler receives the payload with `correlationId` and `messageId`
    /// filled in. It never runs for a non-object payload, a completed key, or a
    /// key already in flight.
    pub async fn handle<F, Fut>(&self, payload: Value, handler: F) -> MessageReply
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, HandlerError>>,
    {
        let Value::Object(mut payload) = payload else {
            return MessageReply::Error {
                correlation_id: generate_correlation_id(Some(&self.id_prefix)),
                message_id: generate_message_id(),
                message: "message payload must be a JSON object".to_string(),
            };
        };

        let correlation_id = non_empty_str(&payload, CORRELATION_ID_FIELD)
            .map_or_else(|| generate_correlation_id(Some(&self.id_prefix)), str::to_string);
        let message_id = non_empty_str(&payload, MESSAGE_ID_FIELD)
            .map_or_else(generate_message_id, str::to_string);
        let idempotency_key = non_empty_str(&payload, IDEMPOTENCY_KEY_FIELD).map(str::to_string);
        let causation_id = non_empty_str(&payload, CAUSATION_ID_FIELD).map(str::to_string);
        let event_type = non_empty_str(&payload, MESSAGE_TYPE_FIELD).unwrap_or(MESSAGE_EVENT).to_string();

        payload.insert(
            CORRELATION_ID_FIELD.to_string(),
            Value::String(correlation_id.clone()),
        );
        payload.insert(MESSAGE_ID_FIELD.to_string(), Value::String(message_id.clone()));

        let outcome = self
            .guard
            .execute(
                idempotency_key.as_deref(),
                &correlation_id,
                &message_id,
                || async {
                    self.record_message(
                        &correlation_id,
                        &message_id,
                        causation_id.as_deref(),
                        &event_type,
                        idempotency_key.as_deref(),
                    )
                    .await;
                    handler(Value::Object(payload)).await
                },
            )
            .await;

        match outcome {
            Ok(GuardOutcome::Untracked(data) | GuardOutcome::Executed(data)) => {
                MessageReply::Result {
                    correlation_id,
                    message_id,
                    data,
                }
            }
            Ok(GuardOutcome::Replayed(data)) => MessageReply::AlreadyProcessed {
                correlation_id,
                message_id,
                idempotency_key: idempotency_key.unwrap_or_default(),
                data,
            },
            Ok(GuardOutcome::Rejected) => MessageReply::DuplicateInFlight {
                correlation_id,
                message_id,
                idempotency_key: idempotency_key.unwrap_or_default(),
            },
            Err(GuardError::Handler(e)) => MessageReply::Error {
                correlation_id,
                message_id,
                message: e.to_string(),
            },
            Err(GuardError::Idempotency(e)) => {
                tracing::error!(
                    correlation_id = %correlation_id,
                    message_id = %message_id,
                    error = %e,
                    "Message rejected, idempotency store unavailable"
                );
                MessageReply::Error {
                    correlation_id,
                    message_id,
                    message: "idempotency store unavailable, retry later".to_string(),
                }
            }
        }
    }
}

impl<S: KeyValueStore> MessageGuard<S> {
    async fn record_message(
        &self,
        correlation_id: &str,
        message_id: &str,
        causation_id: Option<&str>,
        event_type: &str,
        idempotency_key: Option<&str>,
    ) {
        self.correlation
            .add_metadata(correlation_id, MetadataUpdate::default().service(&self.service))
            .await;

        let fields = idempotency_key.map(|key| {
            let mut fields = Map::new();
            fields.insert(IDEMPOTENCY_KEY_FIELD.to_string(), Value::from(key));
            fields
        });
        self.correlation
            .record_event_chain(
                correlation_id,
                message_id,
                causation_id,
                event_type,
                &self.service,
                fields,
            )
            .await;
    }
}
