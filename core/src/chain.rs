//! Event chains, causal trees and correlation metadata.
//!
//! An event chain is the append-only list of [`EventChainNode`]s recorded under
//! one correlation id. List order is insertion order, which is not necessarily
//! causal order: two services can append concurrently. Causality is carried by
//! `causation_id`, and [`build_causal_tree_from`] turns the flat list back into
//! a forest.
//!
//! # Example
//!
//! ```
//! use idempotency_core::chain::{EventChainNode, build_causal_tree_from};
//! use chrono::Utc;
//!
//! let now = Utc::now();
//! let chain = vec![
//!     EventChainNode::new("a", None, "ReservationRequested", "api", now),
//!     EventChainNode::new("b", Some("a".to_string()), "SeatHeld", "inventory", now),
//! ];
//!
//! let tree = build_causal_tree_from(&chain);
//! assert!(tree["a"].children.contains_key("b"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One recorded event in a correlation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventChainNode {
    /// Unique id of this event.
    pub message_id: String,

    /// Id of the event that directly triggered this one.
    #[serde(default)]
    pub causation_id: Option<String>,

    /// Event type name.
    pub event_type: String,

    /// Service that handled the event.
    pub service: String,

    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl EventChainNode {
    /// Create a chain node without metadata.
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        causation_id: Option<String>,
        event_type: impl Into<String>,
        service: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            causation_id,
            event_type: event_type.into(),
            service: service.into(),
            timestamp,
            metadata: Map::new(),
        }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A node of a causal tree with its nested children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalNode {
    /// The recorded event.
    #[serde(flatten)]
    pub event: EventChainNode,

    /// Events caused by this one, keyed by message id.
    pub children: CausalTree,
}

/// Forest of causal trees keyed by root message id.
pub type CausalTree = BTreeMap<String, CausalNode>;

/// Rebuild the causal forest from a flat chain.
///
/// Pass one indexes every message id (first occurrence wins for duplicates).
/// Pass two links each node under its parent when the parent is present in
/// the chain; nodes without a causation id, or whose parent is missing
/// (orphans), become roots. Nodes that are only reachable through a cycle
/// are promoted to roots as well, so every indexed event appears exactly once.
#[must_use]
pub fn build_causal_tree_from(chain: &[EventChainNode]) -> CausalTree {
    // Pass 1: lookup table of node shells.
    let mut lookup: HashMap<&str, &EventChainNode> = HashMap::with_capacity(chain.len());
    let mut order: Vec<&str> = Vec::with_capacity(chain.len());
    for node in chain {
        if !lookup.contains_key(node.message_id.as_str()) {
            lookup.insert(&node.message_id, node);
            order.push(&node.message_id);
        }
    }

    // Pass 2: parent links and roots.
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut roots: Vec<&str> = Vec::new();
    for &id in &order {
        let node: &EventChainNode = lookup[id];
        let parent = node
            .causation_id
            .as_deref()
            .filter(|parent| lookup.contains_key(parent));
        match parent {
            Some(parent) => children.entry(parent).or_default().push(id),
            None => roots.push(id),
        }
    }

    let mut visited: HashSet<&str> = HashSet::with_capacity(order.len());
    let mut forest = CausalTree::new();
    for root in roots {
        if let Some(node) = assemble(root, &lookup, &children, &mut visited) {
            forest.insert(root.to_string(), node);
        }
    }

    // Anything still unvisited sits on a cycle.
    for id in order {
        if let Some(node) = assemble(id, &lookup, &children, &mut visited) {
            forest.insert(id.to_string(), node);
        }
    }

    forest
}

fn assemble<'a>(
    id: &'a str,
    lookup: &HashMap<&'a str, &'a EventChainNode>,
    children: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
) -> Option<CausalNode> {
    if !visited.insert(id) {
        return None;
    }

    let event = (*lookup.get(id)?).clone();
    let mut nested = CausalTree::new();
    for &child in children.get(id).into_iter().flatten() {
        if let Some(node) = assemble(child, lookup, children, visited) {
            nested.insert(child.to_string(), node);
        }
    }

    Some(CausalNode {
        event,
        children: nested,
    })
}

/// Metadata describing the unit of work behind a correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationMetadata {
    /// The correlation id.
    pub correlation_id: String,

    /// First time this correlation id was seen.
    pub start_time: DateTime<Utc>,

    /// Originating service.
    #[serde(default)]
    pub service: Option<String>,

    /// Originating endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Initiating user.
    #[serde(default)]
    pub user_id: Option<String>,

    /// Free-form fields, shallow-merged on every write.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CorrelationMetadata {
    /// Create an empty metadata blob.
    #[must_use]
    pub fn new(correlation_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            start_time,
            service: None,
            endpoint: None,
            user_id: None,
            metadata: Map::new(),
        }
    }

    /// Merge an update: provided fields win, the nested map is merged per key.
    ///
    /// `correlation_id` and `start_time` are never changed by a merge.
    pub fn merge(&mut self, update: MetadataUpdate) {
        if update.service.is_some() {
            self.service = update.service;
        }
        if update.endpoint.is_some() {
            self.endpoint = update.endpoint;
        }
        if update.user_id.is_some() {
            self.user_id = update.user_id;
        }
        self.metadata.extend(update.metadata);
    }
}

/// Partial write applied to [`CorrelationMetadata`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdate {
    /// Originating service.
    #[serde(default)]
    pub service: Option<String>,

    /// Originating endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Initiating user.
    #[serde(default)]
    pub user_id: Option<String>,

    /// Fields merged into the metadata map.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MetadataUpdate {
    /// Set the originating service.
    #[must_use]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Set the originating endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the initiating user.
    #[must_use]
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Add a free-form field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Summary statistics derived from a chain and its metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStats {
    /// Number of recorded events.
    pub total_events: usize,

    /// Distinct services, in order of first appearance.
    pub services: Vec<String>,

    /// Milliseconds elapsed since the correlation's start time (0 if unknown).
    pub duration: u64,

    /// Count of events per event type.
    pub event_types: BTreeMap<String, usize>,
}

impl ChainStats {
    /// Derive statistics from a chain.
    ///
    /// `duration` is measured from `start_time` to `now`; without a start time
    /// it is zero.
    #[must_use]
    pub fn from_chain(
        chain: &[EventChainNode],
        start_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut services: Vec<String> = Vec::new();
        let mut event_types: BTreeMap<String, usize> = BTreeMap::new();

        for node in chain {
            if !services.contains(&node.service) {
                services.push(node.service.clone());
            }
            *event_types.entry(node.event_type.clone()).or_default() += 1;
        }

        let duration = start_time
            .map(|start| now.signed_duration_since(start).num_milliseconds())
            .and_then(|ms| u64::try_from(ms).ok())
            .unwrap_or(0);

        Self {
            total_events: chain.len(),
            services,
            duration,
            event_types,
        }
    }
}
