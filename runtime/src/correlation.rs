//! Correlation ids, event chains and causal trees.
//!
//! Everything written by this service is observability data. Store errors are
//! logged and counted but never returned: chain recording must not affect the
//! claim/replay path.
//!
//! # Storage layout
//!
//! - `{namespace}:chain:{correlation_id}`: list of JSON [`EventChainNode`]s,
//!   append order, TTL refreshed on every append
//! - `{namespace}:correlation:{correlation_id}`: JSON [`CorrelationMetadata`],
//!   TTL refreshed on every write

use crate::metrics::CorrelationMetrics;
use idempotency_core::environment::{Clock, SystemClock};
use idempotency_core::{
    CausalTree, ChainStats, CorrelationMetadata, EventChainNode, IdempotencyConfig,
    KeyValueStore, MetadataUpdate, StoreResult, build_causal_tree_from, generate_correlation_id,
    generate_message_id,
};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Event-chain recording and causal reconstruction over a [`KeyValueStore`].
///
/// # Example
///
/// ```
/// use idempotency_core::IdempotencyConfig;
/// use idempotency_runtime::CorrelationService;
/// use idempotency_testing::InMemoryStore;
///
/// # async fn example() {
/// let correlation = CorrelationService::new(InMemoryStore::new(), IdempotencyConfig::default());
///
/// let corr = correlation.generate_correlation_id(Some("api"));
/// correlation.record_event_chain(&corr, "msg-a", None, "ReservationRequested", "api", None).await;
/// correlation.record_event_chain(&corr, "msg-b", Some("msg-a"), "SeatHeld", "inventory", None).await;
///
/// let tree = correlation.build_causal_tree(&corr).await;
/// assert!(tree["msg-a"].children.contains_key("msg-b"));
/// # }
/// ```
pub struct CorrelationService<S> {
    store: S,
    config: Arc<IdempotencyConfig>,
    clock: Arc<dyn Clock>,
}

impl<S: Clone> Clone for CorrelationService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> std::fmt::Debug for CorrelationService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> CorrelationService<S> {
    /// Create a service on the system clock.
    #[must_use]
    pub fn new(store: S, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A fresh correlation id, optionally prefixed (default prefix `corr`).
    #[must_use]
    pub fn generate_correlation_id(&self, prefix: Option<&str>) -> String {
        generate_correlation_id(prefix)
    }

    /// A fresh message id.
    #[must_use]
    pub fn generate_message_id(&self) -> String {
        generate_message_id()
    }

    /// Append an event to a correlation chain.
    ///
    /// Fire-and-forget: failures are logged and dropped.
    pub async fn record_event_chain(
        &self,
        correlation_id: &str,
        message_id: &str,
        causation_id: Option<&str>,
        event_type: &str,
        service: &str,
        metadata: Option<Map<String, Value>>,
    ) {
        let node = EventChainNode::new(
            message_id,
            causation_id.map(str::to_string),
            event_type,
            service,
            self.clock.now(),
        )
        .with_metadata(metadata.unwrap_or_default());

        let bytes = match serde_json::to_vec(&node) {
            Ok(bytes) => bytes,
            Err(e) => {
                CorrelationMetrics::record_chain_error();
                tracing::warn!(
                    correlation_id = correlation_id,
                    message_id = message_id,
                    error = %e,
                    "Failed to encode event chain entry"
                );
                return;
            }
        };

        let key = self.config.chain_key(correlation_id);
        let written = async {
            self.store.list_append(&key, bytes).await?;
            self.store.expire(&key, self.config.chain_ttl).await
        }
        .await;

        match written {
            Ok(()) => {
                CorrelationMetrics::record_chain_entry();
                tracing::debug!(
                    correlation_id = correlation_id,
                    message_id = message_id,
                    causation_id = causation_id,
                    event_type = event_type,
                    service = service,
                    "Recorded event chain entry"
                );
            }
            Err(e) => {
                CorrelationMetrics::record_chain_error();
                tracing::warn!(
                    correlation_id = correlation_id,
                    message_id = message_id,
                    error = %e,
                    "Failed to record event chain entry"
                );
            }
        }
    }

    /// The chain of a correlation id in append order.
    ///
    /// Entries that do not decode are skipped; a store error yields an empty
    /// chain.
    pub async fn get_event_chain(&self, correlation_id: &str) -> Vec<EventChainNode> {
        // TODO: page through LRANGE in fixed windows once chains outgrow a single read.
        let raw = match self
            .store
            .list_range(&self.config.chain_key(correlation_id), 0, -1)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    correlation_id = correlation_id,
                    error = %e,
                    "Failed to read event chain"
                );
                return Vec::new();
            }
        };

        raw.iter()
            .filter_map(|bytes| match serde_json::from_slice::<EventChainNode>(bytes) {
                Ok(node) => Some(node),
                Err(e) => {
                    tracing::warn!(
                        correlation_id = correlation_id,
                        error = %e,
                        "Skipping undecodable event chain entry"
                    );
                    None
                }
            })
            .collect()
    }

    /// Rebuild the causal forest of a correlation id.
    pub async fn build_causal_tree(&self, correlation_id: &str) -> CausalTree {
        let chain = self.get_event_chain(correlation_id).await;
        build_causal_tree_from(&chain)
    }

    /// Merge fields into a correlation's metadata, creating it on first sight.
    ///
    /// Provided top-level fields win; the free-form map is merged per key.
    /// Failures are logged and dropped. If the existing metadata cannot be
    /// read, nothing is written.
    pub async fn add_metadata(&self, correlation_id: &str, update: MetadataUpdate) {
        let existing = match self.load_metadata(correlation_id).await {
            Ok(existing) => existing,
            Err(e) => {
                CorrelationMetrics::record_chain_error();
                tracing::warn!(
                    correlation_id = correlation_id,
                    error = %e,
                    "Failed to read correlation metadata, skipping merge"
                );
                return;
            }
        };
        let mut metadata =
            existing.unwrap_or_else(|| CorrelationMetadata::new(correlation_id, self.clock.now()));
        metadata.merge(update);

        let bytes = match serde_json::to_vec(&metadata) {
            Ok(bytes) => bytes,
            Err(e) => {
                CorrelationMetrics::record_chain_error();
                tracing::warn!(
                    correlation_id = correlation_id,
                    error = %e,
                    "Failed to encode correlation metadata"
                );
                return;
            }
        };

        if let Err(e) = self
            .store
            .set(
                &self.config.metadata_key(correlation_id),
                bytes,
                self.config.metadata_ttl,
            )
            .await
        {
            CorrelationMetrics::record_chain_error();
            tracing::warn!(
                correlation_id = correlation_id,
                error = %e,
                "Failed to write correlation metadata"
            );
        }
    }

    /// The metadata of a correlation id, if any was recorded.
    pub async fn get_metadata(&self, correlation_id: &str) -> Option<CorrelationMetadata> {
        self.load_metadata(correlation_id)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    correlation_id = correlation_id,
                    error = %e,
                    "Failed to read correlation metadata"
                );
            })
            .ok()
            .flatten()
    }

    /// Read metadata, separating store failures from absence. Undecodable
    /// metadata counts as absent.
    async fn load_metadata(&self, correlation_id: &str) -> StoreResult<Option<CorrelationMetadata>> {
        let Some(bytes) = self
            .store
            .get(&self.config.metadata_key(correlation_id))
            .await?
        else {
            return Ok(None);
        };

        Ok(serde_json::from_slice(&bytes)
            .inspect_err(|e| {
                tracing::warn!(
                    correlation_id = correlation_id,
                    error = %e,
                    "Discarding undecodable correlation metadata"
                );
            })
            .ok())
    }

    /// Statistics over the chain and metadata of a correlation id.
    ///
    /// An unknown correlation id yields empty statistics.
    pub async fn get_chain_stats(&self, correlation_id: &str) -> ChainStats {
        let chain = self.get_event_chain(correlation_id).await;
        let start_time = self
            .get_metadata(correlation_id)
            .await
            .map(|metadata| metadata.start_time);
        ChainStats::from_chain(&chain, start_time, self.clock.now())
    }
}
