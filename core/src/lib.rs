//! # Idempotency Core
//!
//! Core traits and types for idempotent execution and causal tracing.
//!
//! This crate holds everything the services agree on but nothing that talks to
//! a concrete backend:
//!
//! - **Store contract**: [`store::KeyValueStore`], the only shared mutable resource
//! - **Idempotency records**: per-key claim state ([`record::IdempotencyRecord`])
//! - **Event chains**: append-only causal logs per correlation id ([`chain`])
//! - **Envelopes**: the wire shape of inbound events ([`envelope::EventEnvelope`])
//! - **Configuration**: TTLs and key namespacing ([`config::IdempotencyConfig`])
//!
//! ## Architecture Principles
//!
//! - Per-key atomicity is the only safety mechanism (no multi-key transactions)
//! - Claims fail closed, read-only checks fail open
//! - Observability writes never affect the correctness path
//! - Configuration is an explicit value, never ambient global state
//!
//! ## Example
//!
//! ```
//! use idempotency_core::compose_idempotency_key;
//!
//! let key = compose_idempotency_key(["create-reservation", "", "42"]);
//! assert_eq!(key, "create-reservation:42");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod chain;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod record;
pub mod store;

pub use chain::{
    CausalNode, CausalTree, ChainStats, CorrelationMetadata, EventChainNode, MetadataUpdate,
    build_causal_tree_from,
};
pub use config::IdempotencyConfig;
pub use envelope::{EnvelopeContext, EventContext, EventEnvelope};
pub use error::{HandlerError, IdempotencyError, StoreError};
pub use ids::{compose_idempotency_key, generate_correlation_id, generate_message_id};
pub use record::{ClaimOutcome, IdempotencyCheck, IdempotencyRecord, OperationStatus};
pub use store::{KeyValueStore, StoreResult};

/// Environment module - injected dependencies for testability
///
/// All time reads inside the services go through [`environment::Clock`] so that
/// TTL expiry and chain durations can be driven deterministically in tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use idempotency_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
