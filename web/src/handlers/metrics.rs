//! Prometheus scrape endpoint.

use axum::{extract::State, http::StatusCode};
use idempotency_runtime::metrics::MetricsServer;
use std::sync::Arc;

/// Render the Prometheus exposition.
///
/// Returns 503 until [`MetricsServer::start`] has installed the recorder.
///
/// # Endpoint
///
/// ```text
/// GET /metrics
/// ```
#[allow(clippy::unused_async)]
pub async fn render(State(metrics): State<Arc<MetricsServer>>) -> (StatusCode, String) {
    metrics.render().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "metrics recorder not installed".to_string(),
            )
        },
        |body| (StatusCode::OK, body),
    )
}
