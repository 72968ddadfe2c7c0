//! Event envelopes for event-driven handlers.
//!
//! An [`EventEnvelope`] is the wire shape of an inbound event: a type name, an
//! opaque JSON payload and a conventional `context` sub-structure carrying the
//! tracing ids. Every context field is optional on the wire; handlers resolve
//! them into an [`EventContext`], synthesizing ids that are missing.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "eventType": "ReservationConfirmed",
//!   "data": { "reservationId": "r-42" },
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "context": {
//!     "correlationId": "api-1735689600000-Xy3...",
//!     "messageId": "msg-1735689600001-Ab9...",
//!     "causationId": "msg-1735689600000-Qw2...",
//!     "retryCount": 0,
//!     "maxRetries": 3
//!   }
//! }
//! ```

use crate::ids::{generate_correlation_id, generate_message_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default retry budget when an event does not carry one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Tracing fields as they appear on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeContext {
    /// Correlation id of the initiating unit of work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Id of this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Id of the event that triggered this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Service that emitted the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Delivery attempts so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// An inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Event type name (e.g. `"ReservationConfirmed"`).
    pub event_type: String,

    /// Domain payload, opaque to this subsystem.
    #[serde(default)]
    pub data: serde_json::Value,

    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,

    /// Tracing context.
    #[serde(default)]
    pub context: EnvelopeContext,
}

impl EventEnvelope {
    /// Create an envelope with an empty context.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            context: EnvelopeContext::default(),
        }
    }

    /// Create a downstream event caused by `parent`.
    ///
    /// The new event keeps the parent's correlation id, gets a fresh message id
    /// and links back through `causation_id = parent.message_id`.
    #[must_use]
    pub fn caused_by(
        parent: &EventContext,
        event_type: impl Into<String>,
        service: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            context: EnvelopeContext {
                correlation_id: Some(parent.correlation_id.clone()),
                message_id: Some(generate_message_id()),
                causation_id: Some(parent.message_id.clone()),
                service: Some(service.into()),
                retry_count: None,
                max_retries: Some(parent.max_retries),
            },
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.context.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.context.message_id = Some(message_id.into());
        self
    }

    /// Set the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.context.causation_id = Some(causation_id.into());
        self
    }

    /// Set the delivery attempt counters.
    #[must_use]
    pub const fn with_retries(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.context.retry_count = Some(retry_count);
        self.context.max_retries = Some(max_retries);
        self
    }

    /// Resolve the wire context for a handler running in `service`.
    ///
    /// Missing correlation and message ids are synthesized. Note that a
    /// synthesized message id differs on every call, so idempotency for such
    /// events falls back to the composite key.
    #[must_use]
    pub fn resolve_context(&self, service: &str) -> EventContext {
        let ctx = &self.context;
        EventContext {
            event_type: self.event_type.clone(),
            service: service.to_string(),
            correlation_id: ctx
                .correlation_id
                .clone()
                .unwrap_or_else(|| generate_correlation_id(Some("evt"))),
            message_id: ctx.message_id.clone().unwrap_or_else(generate_message_id),
            message_id_synthesized: ctx.message_id.is_none(),
            causation_id: ctx.causation_id.clone(),
            retry_count: ctx.retry_count.unwrap_or(0),
            max_retries: ctx.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            timestamp: self.timestamp,
        }
    }
}

/// Resolved processing context of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    /// Event type name.
    pub event_type: String,
    /// Service handling the event.
    pub service: String,
    /// Correlation id (received or synthesized).
    pub correlation_id: String,
    /// Message id (received or synthesized).
    pub message_id: String,
    /// Whether `message_id` was synthesized because the event lacked one.
    #[serde(default)]
    pub message_id_synthesized: bool,
    /// Id of the triggering event, if any.
    pub causation_id: Option<String>,
    /// Delivery attempts so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_context_uses_wire_fields() {
        let envelope = EventEnvelope::new("SeatHeld", json!({"seat": "A1"}))
            .with_correlation_id("corr-1")
            .with_message_id("msg-1")
            .with_causation_id("msg-0")
            .with_retries(1, 5);

        let ctx = envelope.resolve_context("inventory");

        assert_eq!(ctx.correlation_id, "corr-1");
        assert_eq!(ctx.message_id, "msg-1");
        assert!(!ctx.message_id_synthesized);
        assert_eq!(ctx.causation_id.as_deref(), Some("msg-0"));
        assert_eq!(ctx.retry_count, 1);
        assert_eq!(ctx.max_retries, 5);
        assert_eq!(ctx.service, "inventory");
    }

    #[test]
    fn resolve_context_synthesizes_missing_ids() {
        let ctx = EventEnvelope::new("SeatHeld", json!({})).resolve_context("inventory");

        assert!(ctx.correlation_id.starts_with("evt-"));
        assert!(ctx.message_id.starts_with("msg-"));
        assert!(ctx.message_id_synthesized);
        assert_eq!(ctx.retry_count, 0);
        assert_eq!(ctx.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn caused_by_links_to_parent() {
        let parent = EventEnvelope::new("ReservationRequested", json!({}))
            .with_correlation_id("corr-9")
            .with_message_id("msg-parent")
            .resolve_context("api");

        let child = EventEnvelope::caused_by(&parent, "SeatHeld", "inventory", json!({}));

        assert_eq!(child.context.correlation_id.as_deref(), Some("corr-9"));
        assert_eq!(child.context.causation_id.as_deref(), Some("msg-parent"));
        assert_ne!(child.context.message_id.as_deref(), Some("msg-parent"));
    }

    #[test]
    fn context_is_optional_on_the_wire() {
        let envelope: EventEnvelope = serde_json::from_value(json!({
            "eventType": "SeatHeld",
            "timestamp": "2025-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(envelope.context, EnvelopeContext::default());
        assert!(envelope.data.is_null());
    }
}
