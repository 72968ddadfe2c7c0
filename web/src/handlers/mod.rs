//! HTTP and WebSocket handlers.

pub mod health;
pub mod metrics;
pub mod websocket;

pub use health::health_check;
pub use websocket::{MessageHandler, WsState};
