//! Axum adapters for the idempotency subsystem.
//!
//! This crate is the HTTP and WebSocket shell around `idempotency-runtime`:
//! it maps transport details (headers, status codes, frames) onto the
//! guard state machine and back.
//!
//! # Request Flow
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ CorrelationIdLayer           │  ← X-Correlation-ID, http_request span
//! ├──────────────────────────────┤
//! │ IdempotencyLayer             │  ← Idempotency-Key: replay / 409 / claim
//! ├──────────────────────────────┤
//! │ Application handler          │  ← runs at most once per key
//! └──────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::post};
//! use idempotency_web::AppState;
//!
//! let state = AppState::new(store, IdempotencyConfig::from_env());
//! let app = state.guard_routes(
//!     Router::new().route("/api/v1/reservations", post(create_reservation)),
//! );
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod state;

pub use error::AppError;
pub use extractors::{CorrelationId, IdempotencyKey};
pub use middleware::{
    CORRELATION_ID_HEADER, CachedResponse, IDEMPOTENCY_REPLAYED_HEADER, IdempotencyLayer,
    correlation_id_layer,
};
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
