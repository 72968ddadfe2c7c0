//! Axum middleware for correlation tracking and idempotent requests.
//!
//! - [`correlation_id_layer`]: resolves the request's correlation id, stores
//!   it in request extensions, runs the request inside an `http_request` span
//!   and echoes the id back in `X-Correlation-ID`.
//! - [`IdempotencyLayer`]: runs mutating requests carrying an
//!   `Idempotency-Key` header through the [`RequestGuard`] so their side
//!   effects happen at most once, and records each executed request in the
//!   correlation's event chain.
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::post};
//! use idempotency_web::middleware::{IdempotencyLayer, correlation_id_layer};
//!
//! let app = Router::new()
//!     .route("/reservations", post(create_reservation))
//!     .layer(IdempotencyLayer::new(guard, correlation))
//!     .layer(correlation_id_layer());
//! ```
//!
//! The correlation layer must wrap the idempotency layer so the guard sees the
//! resolved correlation id.
//!
//! # Idempotent request flow
//!
//! 1. **Skip** anything but `POST`, `PUT` and `PATCH`, and requests without a key
//! 2. **Reject** malformed keys with 400
//! 3. **Replay** a completed key from its cached response, with `Idempotency-Replayed: true`
//! 4. **Reject** a key held by another request with 409
//! 5. **Claim** the key, record the request under its correlation id and run
//!    the inner service
//! 6. **Record** 2xx/3xx responses as completed, everything else as failed.
//!    Responses larger than the cacheable limit are failed with a 500

use crate::error::AppError;
use crate::extractors::{CorrelationId, IDEMPOTENCY_KEY_HEADER, header_id};
use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::BoxFuture;
use idempotency_core::{
    KeyValueStore, MetadataUpdate, compose_idempotency_key, generate_message_id,
};
use idempotency_runtime::{CorrelationService, GuardError, GuardOutcome, RequestGuard};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::fmt;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

pub use crate::extractors::CORRELATION_ID_HEADER;

/// Response header marking a replayed response.
pub const IDEMPOTENCY_REPLAYED_HEADER: &str = "Idempotency-Replayed";

/// Default cap on a response body stored for replay (1 MiB).
pub const DEFAULT_MAX_CACHED_BODY: usize = 1024 * 1024;

/// Event type recorded in the chain for each executed guarded request.
pub const HTTP_REQUEST_EVENT: &str = "HttpRequest";

/// Headers that describe the connection rather than the response.
static UNCACHED_HEADERS: [header::HeaderName; 9] = [
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::DATE,
];

/// Create a layer that adds correlation ID tracking to all requests.
#[must_use]
pub const fn correlation_id_layer() -> CorrelationIdLayer {
    CorrelationIdLayer
}

/// Layer for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdLayer;

impl<S> Layer<S> for CorrelationIdLayer {
    type Service = CorrelationIdMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationIdMiddleware { inner }
    }
}

/// Middleware service for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdMiddleware<S> {
    inner: S,
}

impl<S> Service<Request> for CorrelationIdMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let CorrelationId(correlation_id) = CorrelationId::from_headers(req.headers());
        req.extensions_mut()
            .insert(CorrelationId(correlation_id.clone()));

        let span = tracing::info_span!(
            "http_request",
            correlation_id = %correlation_id,
            method = %req.method(),
            uri = %req.uri(),
        );

        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.instrument(span).await?;

            if let Ok(header_value) = HeaderValue::from_str(&correlation_id) {
                response
                    .headers_mut()
                    .insert(CORRELATION_ID_HEADER, header_value);
            }

            Ok(response)
        })
    }
}

/// A successful response as stored in the idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers as `(name, value)` pairs, connection headers excluded.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Base64-encoded response body.
    pub body: String,
}

impl CachedResponse {
    fn capture(status: StatusCode, headers: &http::HeaderMap, body: &[u8]) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| !UNCACHED_HEADERS.contains(*name) && name.as_str() != "keep-alive")
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        Self {
            status: status.as_u16(),
            headers,
            body: BASE64.encode(body),
        }
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let Ok(status) = StatusCode::from_u16(self.status) else {
            return AppError::internal("Cached response has an invalid status").into_response();
        };
        let body = match BASE64.decode(self.body.as_bytes()) {
            Ok(body) => body,
            Err(e) => {
                return AppError::internal("Cached response body is corrupt")
                    .with_source(e.into())
                    .into_response();
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        for (name, value) in self.headers {
            match (
                header::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => tracing::warn!(header = %name, "Skipping unreadable cached header"),
            }
        }
        response
    }
}

/// A non-success response from the inner service. Passed back untouched.
struct FailedResponse(Response);

impl fmt::Display for FailedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler responded with {}", self.0.status())
    }
}

fn is_guarded_method(method: &Method) -> bool {
    method == Method::POST || method == Method::PUT || method == Method::PATCH
}

/// Layer that makes mutating requests idempotent.
pub struct IdempotencyLayer<S> {
    guard: RequestGuard<S>,
    correlation: CorrelationService<S>,
    service: String,
    max_cached_body: usize,
}

impl<S: KeyValueStore> IdempotencyLayer<S> {
    /// Create a layer over a request guard. Executed requests are recorded
    /// through `correlation` under the service name `http`.
    #[must_use]
    pub fn new(guard: RequestGuard<S>, correlation: CorrelationService<S>) -> Self {
        Self {
            guard,
            correlation,
            service: "http".to_string(),
            max_cached_body: DEFAULT_MAX_CACHED_BODY,
        }
    }

    /// Service name recorded in event chains and correlation metadata.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Largest response body stored for replay. Larger responses are treated
    /// as failures.
    #[must_use]
    pub const fn with_max_cached_body(mut self, bytes: usize) -> Self {
        self.max_cached_body = bytes;
        self
    }
}

impl<S: Clone> Clone for IdempotencyLayer<S> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            correlation: self.correlation.clone(),
            service: self.service.clone(),
            max_cached_body: self.max_cached_body,
        }
    }
}

impl<S> fmt::Debug for IdempotencyLayer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyLayer")
            .field("guard", &self.guard)
            .field("service", &self.service)
            .field("max_cached_body", &self.max_cached_body)
            .finish_non_exhaustive()
    }
}

impl<Svc, S: Clone> Layer<Svc> for IdempotencyLayer<S> {
    type Service = IdempotencyMiddleware<Svc, S>;

    fn layer(&self, inner: Svc) -> Self::Service {
        IdempotencyMiddleware {
            inner,
            layer: self.clone(),
        }
    }
}

/// Middleware service for idempotent requests.
pub struct IdempotencyMiddleware<Svc, S> {
    inner: Svc,
    layer: IdempotencyLayer<S>,
}

impl<Svc: Clone, S: Clone> Clone for IdempotencyMiddleware<Svc, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            layer: self.layer.clone(),
        }
    }
}

impl<Svc, S> Service<Request> for IdempotencyMiddleware<Svc, S>
where
    Svc: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    S: KeyValueStore,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // The ready service goes into the future; a fresh clone stays behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();

        Box::pin(async move { Ok(guarded_call(layer, inner, req).await) })
    }
}

async fn call_inner<Svc>(mut inner: Svc, req: Request) -> Response
where
    Svc: Service<Request, Response = Response, Error = Infallible>,
{
    match inner.call(req).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    }
}

async fn guarded_call<Svc, S>(layer: IdempotencyLayer<S>, inner: Svc, req: Request) -> Response
where
    Svc: Service<Request, Response = Response, Error = Infallible> + Send,
    Svc::Future: Send,
    S: KeyValueStore,
{
    if !is_guarded_method(req.method()) {
        return call_inner(inner, req).await;
    }

    let header_key = match header_id(req.headers(), IDEMPOTENCY_KEY_HEADER) {
        Ok(Some(key)) => key.to_string(),
        Ok(None) => return call_inner(inner, req).await,
        Err(e) => return e.into_response(),
    };

    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let key = compose_idempotency_key(["http", method.as_str(), path.as_str(), header_key.as_str()]);
    let CorrelationId(correlation_id) = req
        .extensions()
        .get::<CorrelationId>()
        .cloned()
        .unwrap_or_else(|| CorrelationId::from_headers(req.headers()));
    let message_id = generate_message_id();

    let IdempotencyLayer {
        guard,
        correlation,
        service,
        max_cached_body,
    } = layer;
    let (correlation_ref, message_ref, key_ref) =
        (correlation_id.as_str(), message_id.as_str(), header_key.as_str());

    // The live response is handed back as-is; only the cached copy is stored.
    let mut live = None;
    let live_slot = &mut live;
    let outcome = guard
        .execute(Some(&key), &correlation_id, &message_id, move || async move {
            record_request(
                &correlation,
                &service,
                correlation_ref,
                message_ref,
                &method,
                &path,
                key_ref,
            )
            .await;

            let (parts, body) = call_inner(inner, req).await.into_parts();
            if !(parts.status.is_success() || parts.status.is_redirection()) {
                return Err(FailedResponse(Response::from_parts(parts, body)));
            }

            let bytes: Bytes = match axum::body::to_bytes(body, max_cached_body).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(
                        key = key_ref,
                        limit = max_cached_body,
                        error = %e,
                        "Response body not cacheable"
                    );
                    let response = AppError::internal("Response could not be stored for replay")
                        .with_source(anyhow::Error::new(e))
                        .into_response();
                    return Err(FailedResponse(response));
                }
            };

            let cached = CachedResponse::capture(parts.status, &parts.headers, &bytes);
            *live_slot = Some(Response::from_parts(parts, Body::from(bytes)));
            Ok(cached)
        })
        .await;

    match outcome {
        Ok(GuardOutcome::Executed(cached) | GuardOutcome::Untracked(cached)) => {
            live.unwrap_or_else(|| cached.into_response())
        }
        Ok(GuardOutcome::Replayed(value)) => replay(&key, value),
        Ok(GuardOutcome::Rejected) => AppError::duplicate_in_flight(&header_key).into_response(),
        Err(GuardError::Handler(FailedResponse(response))) => response,
        Err(GuardError::Idempotency(e)) => AppError::from(e).into_response(),
    }
}

/// Record an executed request in its correlation's chain and metadata.
async fn record_request<S: KeyValueStore>(
    correlation: &CorrelationService<S>,
    service: &str,
    correlation_id: &str,
    message_id: &str,
    method: &str,
    path: &str,
    idempotency_key: &str,
) {
    let endpoint = format!("{method} {path}");
    correlation
        .add_metadata(
            correlation_id,
            MetadataUpdate::default().service(service).endpoint(endpoint),
        )
        .await;

    let mut fields = Map::new();
    fields.insert("method".to_string(), Value::from(method));
    fields.insert("path".to_string(), Value::from(path));
    fields.insert("idempotencyKey".to_string(), Value::from(idempotency_key));
    correlation
        .record_event_chain(
            correlation_id,
            message_id,
            None,
            HTTP_REQUEST_EVENT,
            service,
            Some(fields),
        )
        .await;
}

fn replay(key: &str, value: Value) -> Response {
    match serde_json::from_value::<CachedResponse>(value) {
        Ok(cached) => {
            let mut response = cached.into_response();
            response.headers_mut().insert(
                IDEMPOTENCY_REPLAYED_HEADER,
                HeaderValue::from_static("true"),
            );
            response
        }
        Err(e) => {
            tracing::error!(key = key, error = %e, "Cached result is not an HTTP response");
            AppError::internal("Cached response is unreadable")
                .with_source(e.into())
                .into_response()
        }
    }
}
