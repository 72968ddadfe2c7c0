//! Idempotency and tracing configuration.
//!
//! Configuration is resolved once at bootstrap and passed into each service's
//! constructor. Nothing here is mutable at runtime.

use std::env;
use std::time::Duration;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// TTLs and key namespacing shared by the idempotency and correlation services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// Prefix isolating this deployment's keys in a shared store.
    ///
    /// Default: `"idempotency"`
    pub namespace: String,

    /// Lifetime of a processing claim. This is the only liveness mechanism for
    /// claimants that crash before completing.
    ///
    /// Default: 24 hours
    pub processing_ttl: Duration,

    /// Lifetime of a completed record (replay window).
    ///
    /// Default: 24 hours
    pub completed_ttl: Duration,

    /// Lifetime of a failed record.
    ///
    /// Default: 1 hour
    pub failed_ttl: Duration,

    /// Lifetime of an event chain, refreshed on every append.
    ///
    /// Default: 7 days
    pub chain_ttl: Duration,

    /// Lifetime of correlation metadata, refreshed on every write.
    ///
    /// Default: 7 days
    pub metadata_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            namespace: "idempotency".to_string(),
            processing_ttl: Duration::from_secs(DAY),
            completed_ttl: Duration::from_secs(DAY),
            failed_ttl: Duration::from_secs(HOUR),
            chain_ttl: Duration::from_secs(7 * DAY),
            metadata_ttl: Duration::from_secs(7 * DAY),
        }
    }
}

impl IdempotencyConfig {
    /// Create a configuration with default TTLs under the given namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults:
    ///
    /// - `IDEMPOTENCY_NAMESPACE`
    /// - `IDEMPOTENCY_PROCESSING_TTL_SECS`
    /// - `IDEMPOTENCY_COMPLETED_TTL_SECS`
    /// - `IDEMPOTENCY_FAILED_TTL_SECS`
    /// - `IDEMPOTENCY_CHAIN_TTL_SECS`
    /// - `IDEMPOTENCY_METADATA_TTL_SECS`
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            namespace: env::var("IDEMPOTENCY_NAMESPACE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.namespace),
            processing_ttl: secs_from_env("IDEMPOTENCY_PROCESSING_TTL_SECS")
                .unwrap_or(defaults.processing_ttl),
            completed_ttl: secs_from_env("IDEMPOTENCY_COMPLETED_TTL_SECS")
                .unwrap_or(defaults.completed_ttl),
            failed_ttl: secs_from_env("IDEMPOTENCY_FAILED_TTL_SECS")
                .unwrap_or(defaults.failed_ttl),
            chain_ttl: secs_from_env("IDEMPOTENCY_CHAIN_TTL_SECS").unwrap_or(defaults.chain_ttl),
            metadata_ttl: secs_from_env("IDEMPOTENCY_METADATA_TTL_SECS")
                .unwrap_or(defaults.metadata_ttl),
        }
    }

    /// Set the processing claim TTL.
    #[must_use]
    pub const fn with_processing_ttl(mut self, ttl: Duration) -> Self {
        self.processing_ttl = ttl;
        self
    }

    /// Set the completed record TTL.
    #[must_use]
    pub const fn with_completed_ttl(mut self, ttl: Duration) -> Self {
        self.completed_ttl = ttl;
        self
    }

    /// Set the failed record TTL.
    #[must_use]
    pub const fn with_failed_ttl(mut self, ttl: Duration) -> Self {
        self.failed_ttl = ttl;
        self
    }

    /// Set the event chain TTL.
    #[must_use]
    pub const fn with_chain_ttl(mut self, ttl: Duration) -> Self {
        self.chain_ttl = ttl;
        self
    }

    /// Set the correlation metadata TTL.
    #[must_use]
    pub const fn with_metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = ttl;
        self
    }

    /// Store key of an idempotency record.
    #[must_use]
    pub fn record_key(&self, key: &str) -> String {
        format!("{}:idempotency:{key}", self.namespace)
    }

    /// Store key of the retry lock guarding re-claims of a failed record.
    #[must_use]
    pub fn retry_lock_key(&self, key: &str, retry_count: u32) -> String {
        format!("{}:idempotency-retry:{key}:{retry_count}", self.namespace)
    }

    /// Store key of an event chain.
    #[must_use]
    pub fn chain_key(&self, correlation_id: &str) -> String {
        format!("{}:chain:{correlation_id}", self.namespace)
    }

    /// Store key of correlation metadata.
    #[must_use]
    pub fn metadata_key(&self, correlation_id: &str) -> String {
        format!("{}:correlation:{correlation_id}", self.namespace)
    }
}

fn secs_from_env(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ttls() {
        let config = IdempotencyConfig::default();
        assert_eq!(config.completed_ttl, Duration::from_secs(86_400));
        assert_eq!(config.failed_ttl, Duration::from_secs(3_600));
        assert_eq!(config.chain_ttl, Duration::from_secs(604_800));
    }

    #[test]
    fn keys_are_namespaced() {
        let config = IdempotencyConfig::new("staging");
        assert_eq!(config.record_key("k1"), "staging:idempotency:k1");
        assert_eq!(config.retry_lock_key("k1", 2), "staging:idempotency-retry:k1:2");
        assert_eq!(config.chain_key("c1"), "staging:chain:c1");
        assert_eq!(config.metadata_key("c1"), "staging:correlation:c1");
    }

    #[test]
    fn builder_overrides() {
        let config = IdempotencyConfig::default()
            .with_completed_ttl(Duration::from_secs(60))
            .with_failed_ttl(Duration::from_secs(5));
        assert_eq!(config.completed_ttl, Duration::from_secs(60));
        assert_eq!(config.failed_ttl, Duration::from_secs(5));
    }
}
