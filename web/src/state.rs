//! Application state for Axum handlers.
//!
//! Bundles the services one process needs to put the guard in front of its
//! routes. Domain state (reservations, resources, …) belongs to the
//! application; it can hold an `AppState` alongside its own stores.

use crate::handlers::health_check;
use crate::middleware::{IdempotencyLayer, correlation_id_layer};
use axum::{Router, routing::get};
use idempotency_core::{IdempotencyConfig, KeyValueStore};
use idempotency_runtime::{CorrelationService, IdempotencyService, MessageGuard, RequestGuard};

/// Idempotency and correlation services shared across handlers.
///
/// # Examples
///
/// ```ignore
/// use axum::{Router, routing::post};
/// use idempotency_core::IdempotencyConfig;
/// use idempotency_redis::{RedisConfig, RedisStore};
/// use idempotency_web::AppState;
///
/// let store = RedisStore::connect(&RedisConfig::from_env()).await?;
/// let state = AppState::new(store, IdempotencyConfig::from_env());
///
/// let app = state.guard_routes(
///     Router::new().route("/reservations", post(create_reservation)),
/// );
/// ```
pub struct AppState<S> {
    idempotency: IdempotencyService<S>,
    correlation: CorrelationService<S>,
}

impl<S: Clone> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            idempotency: self.idempotency.clone(),
            correlation: self.correlation.clone(),
        }
    }
}

impl<S> std::fmt::Debug for AppState<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("idempotency", &self.idempotency)
            .field("correlation", &self.correlation)
            .finish()
    }
}

impl<S: KeyValueStore> AppState<S> {
    /// Create state over one store shared by both services.
    #[must_use]
    pub fn new(store: S, config: IdempotencyConfig) -> Self {
        Self {
            idempotency: IdempotencyService::new(store.clone(), config.clone()),
            correlation: CorrelationService::new(store, config),
        }
    }

    /// The idempotency service.
    #[must_use]
    pub const fn idempotency(&self) -> &IdempotencyService<S> {
        &self.idempotency
    }

    /// The correlation service.
    #[must_use]
    pub const fn correlation(&self) -> &CorrelationService<S> {
        &self.correlation
    }

    /// A request guard over the idempotency service.
    #[must_use]
    pub fn request_guard(&self) -> RequestGuard<S> {
        RequestGuard::new(self.idempotency.clone())
    }

    /// The HTTP idempotency layer, recording executed requests through the
    /// correlation service.
    #[must_use]
    pub fn idempotency_layer(&self) -> IdempotencyLayer<S> {
        IdempotencyLayer::new(self.request_guard(), self.correlation.clone())
    }

    /// A message guard for WebSocket handlers.
    #[must_use]
    pub fn message_guard(&self) -> MessageGuard<S> {
        MessageGuard::new(self.request_guard(), self.correlation.clone())
    }

    /// Add `/health` to `routes` and wrap them in the idempotency and
    /// correlation layers, correlation outermost.
    #[must_use]
    pub fn guard_routes(&self, routes: Router) -> Router {
        routes
            .route("/health", get(health_check))
            .layer(self.idempotency_layer())
            .layer(correlation_id_layer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idempotency_testing::InMemoryStore;

    #[test]
    fn test_state_is_clone() {
        fn assert_clone<T: Clone + Send + Sync>() {}
        assert_clone::<AppState<InMemoryStore>>();
    }

    #[test]
    fn test_services_share_namespace() {
        let state = AppState::new(InMemoryStore::new(), IdempotencyConfig::new("shared"));
        assert_eq!(state.idempotency().config().namespace, "shared");
    }
}
