//! Prometheus metrics for idempotency and causal tracing.
//!
//! This module provides metric collection for:
//! - Idempotency checks, claims, completions and failures
//! - Replays served from cached results
//! - Store errors per operation
//! - Event chain recording
//!
//! # Example
//!
//! ```rust,no_run
//! use idempotency_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Rendered text is served by the web layer at /metrics
//! let _text = server.render();
//! # Ok(())
//! # }
//! ```

use idempotency_core::{ClaimOutcome, IdempotencyCheck};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder handle.
///
/// Installs the global recorder and renders the scrape text.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the scrape endpoint is advertised on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Idempotency
    describe_counter!(
        "idempotency_checks_total",
        "Read-only idempotency checks by outcome"
    );
    describe_counter!(
        "idempotency_claims_total",
        "Claim attempts by outcome (new, duplicate)"
    );
    describe_counter!(
        "idempotency_completions_total",
        "Operations marked completed"
    );
    describe_counter!("idempotency_failures_total", "Operations marked failed");
    describe_counter!(
        "idempotency_replays_total",
        "Requests answered from a cached result"
    );
    describe_counter!(
        "idempotency_store_errors_total",
        "Store errors observed by the idempotency service, by operation"
    );
    describe_histogram!(
        "idempotency_guarded_execution_duration_seconds",
        "Time spent executing guarded handlers"
    );

    // Correlation
    describe_counter!(
        "correlation_chain_records_total",
        "Event chain entries recorded"
    );
    describe_counter!(
        "correlation_chain_errors_total",
        "Event chain or metadata writes that failed and were dropped"
    );
}

/// Idempotency metrics recorder.
pub struct IdempotencyMetrics;

impl IdempotencyMetrics {
    /// Record the outcome of a read-only check.
    pub fn record_check(outcome: IdempotencyCheck) {
        let label = match outcome {
            IdempotencyCheck::New => "new",
            IdempotencyCheck::Duplicate => "duplicate",
            IdempotencyCheck::Completed => "completed",
        };
        counter!("idempotency_checks_total", "outcome" => label).increment(1);
    }

    /// Record the outcome of a claim.
    pub fn record_claim(outcome: ClaimOutcome) {
        let label = match outcome {
            ClaimOutcome::New => "new",
            ClaimOutcome::Duplicate => "duplicate",
        };
        counter!("idempotency_claims_total", "outcome" => label).increment(1);
    }

    /// Record an operation completion.
    pub fn record_completion() {
        counter!("idempotency_completions_total").increment(1);
    }

    /// Record an operation failure.
    pub fn record_failure() {
        counter!("idempotency_failures_total").increment(1);
    }

    /// Record a replay from cache.
    pub fn record_replay() {
        counter!("idempotency_replays_total").increment(1);
    }

    /// Record a store error during `operation`.
    pub fn record_store_error(operation: &'static str) {
        counter!("idempotency_store_errors_total", "operation" => operation).increment(1);
    }

    /// Record how long a guarded handler ran.
    pub fn record_execution(duration: Duration) {
        histogram!("idempotency_guarded_execution_duration_seconds")
            .record(duration.as_secs_f64());
    }
}

/// Correlation metrics recorder.
pub struct CorrelationMetrics;

impl CorrelationMetrics {
    /// Record a chain entry write.
    pub fn record_chain_entry() {
        counter!("correlation_chain_records_total").increment(1);
    }

    /// Record a dropped chain or metadata write.
    pub fn record_chain_error() {
        counter!("correlation_chain_errors_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_idempotency_metrics_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        IdempotencyMetrics::record_check(IdempotencyCheck::Completed);
        IdempotencyMetrics::record_claim(ClaimOutcome::New);
        IdempotencyMetrics::record_claim(ClaimOutcome::Duplicate);
        IdempotencyMetrics::record_replay();
        IdempotencyMetrics::record_store_error("claim");
        CorrelationMetrics::record_chain_entry();

        // If another test installed the recorder first, there is no handle.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("idempotency_checks_total"));
            assert!(rendered.contains("idempotency_claims_total"));
            assert!(rendered.contains("outcome=\"duplicate\""));
            assert!(rendered.contains("idempotency_replays_total"));
            assert!(rendered.contains("correlation_chain_records_total"));
        }
    }
}
