//! # Idempotency Runtime
//!
//! Services implementing at-most-once execution and causal tracing on top of a
//! shared [`KeyValueStore`](idempotency_core::KeyValueStore).
//!
//! ## Core Components
//!
//! - **[`IdempotencyService`]**: per-key claim → complete/fail → replay
//! - **[`CorrelationService`]**: id generation, event chains, causal trees
//! - **[`RequestGuard`]**: the guard state machine every adapter shares
//! - **[`MessageGuard`]**: adapter for bidirectional messages
//! - **[`handle_with_idempotency`]**: processing algorithm for event handlers
//!
//! ## Example
//!
//! ```
//! use idempotency_core::{HandlerError, IdempotencyConfig};
//! use idempotency_runtime::{GuardOutcome, IdempotencyService, RequestGuard};
//! use idempotency_testing::InMemoryStore;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = RequestGuard::new(IdempotencyService::new(
//!     InMemoryStore::new(),
//!     IdempotencyConfig::default(),
//! ));
//!
//! let outcome = guard
//!     .execute(Some("create-reservation-42"), "corr-1", "msg-1", || async {
//!         Ok::<_, HandlerError>(json!({"reservationId": "r1"}))
//!     })
//!     .await?;
//! assert!(matches!(outcome, GuardOutcome::Executed(_)));
//! # Ok(())
//! # }
//! ```

/// Correlation ids, event chains and causal trees
pub mod correlation;

/// Guard state machine shared by all adapters
pub mod guard;

/// Per-key idempotency state machine
pub mod idempotency;

/// Guard for bidirectional messages
pub mod message_guard;

/// Prometheus metrics for observability
pub mod metrics;

/// Idempotent event processing
pub mod template;

pub use correlation::CorrelationService;
pub use guard::{GuardError, GuardOutcome, GuardState, RequestGuard};
pub use idempotency::IdempotencyService;
pub use message_guard::{MessageGuard, MessageReply};
pub use template::{
    EventHandler, EventProcessor, ProcessOutcome, ProcessingError, default_idempotency_key,
    default_should_retry, handle_with_idempotency,
};
