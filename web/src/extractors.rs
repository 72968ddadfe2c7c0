//! Custom Axum extractors.
//!
//! - `CorrelationId`: the request's correlation id (set by
//!   [`correlation_id_layer`](crate::middleware::correlation_id_layer), or
//!   read from the header, or generated)
//! - `IdempotencyKey`: the validated `Idempotency-Key` header, if any
//!
//! # Examples
//!
//! ```ignore
//! use idempotency_web::extractors::{CorrelationId, IdempotencyKey};
//!
//! async fn handler(correlation_id: CorrelationId, key: IdempotencyKey) -> String {
//!     format!("{} / {:?}", correlation_id.0, key.0)
//! }
//! ```

use crate::error::AppError;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};
use idempotency_core::generate_correlation_id;

/// Header carrying the caller's correlation id.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Header carrying the caller's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Longest accepted correlation id or idempotency key.
pub const MAX_HEADER_ID_LEN: usize = 255;

/// Read an identifier header.
///
/// Returns `Ok(None)` when the header is absent.
///
/// # Errors
///
/// Returns a 400 [`AppError`] when the header is present but empty, longer
/// than [`MAX_HEADER_ID_LEN`], or not visible ASCII.
pub fn header_id<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, AppError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.len() <= MAX_HEADER_ID_LEN)
        .map(Some)
        .ok_or_else(|| {
            AppError::bad_request(format!(
                "{name} header must be 1-{MAX_HEADER_ID_LEN} visible ASCII characters"
            ))
        })
}

/// Correlation ID for request tracing.
///
/// Prefers the id stored by the correlation layer, then a valid
/// `X-Correlation-ID` header, and otherwise generates a fresh `http-` id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Resolve the correlation id for a set of request headers.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let id = header_id(headers, CORRELATION_ID_HEADER)
            .ok()
            .flatten()
            .map_or_else(|| generate_correlation_id(Some("http")), str::to_string);
        Self(id)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Self>()
            .cloned()
            .unwrap_or_else(|| Self::from_headers(&parts.headers)))
    }
}

/// The `Idempotency-Key` header, validated.
///
/// `None` when the client sent no key. Invalid keys reject with 400.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = header_id(&parts.headers, IDEMPOTENCY_KEY_HEADER)?;
        Ok(Self(key.map(str::to_string)))
    }
}
