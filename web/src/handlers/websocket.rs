//! WebSocket handler running client messages through the message guard.
//!
//! # Message Protocol
//!
//! **Client → Server:** any JSON object. `idempotencyKey`, `correlationId` and
//! `messageId` are optional fields.
//! ```json
//! {
//!   "idempotencyKey": "hold-seat-A1",
//!   "seat": "A1"
//! }
//! ```
//!
//! **Server → Client:** one reply per text frame, tagged by `type`:
//! ```json
//! { "type": "result", "correlationId": "ws-…", "messageId": "msg-…", "data": { … } }
//! { "type": "already_processed", "correlationId": "…", "messageId": "…", "idempotencyKey": "…", "data": { … } }
//! { "type": "duplicate_in_flight", "correlationId": "…", "messageId": "…", "idempotencyKey": "…" }
//! { "type": "error", "correlationId": "…", "messageId": "…", "message": "…" }
//! ```
//!
//! Frames on one connection are processed in order.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, stream::StreamExt};
use idempotency_core::{
    HandlerError, KeyValueStore, generate_correlation_id, generate_message_id,
};
use idempotency_runtime::{MessageGuard, MessageReply};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Application logic behind the WebSocket endpoint.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message payload. The payload always carries `correlationId`
    /// and `messageId`.
    fn handle(&self, payload: Value) -> impl Future<Output = Result<Value, HandlerError>> + Send;
}

/// State for [`handle`]: the guard and the application handler.
pub struct WsState<S, H> {
    guard: MessageGuard<S>,
    handler: Arc<H>,
}

impl<S: KeyValueStore, H: MessageHandler> WsState<S, H> {
    /// Create WebSocket state.
    #[must_use]
    pub fn new(guard: MessageGuard<S>, handler: H) -> Self {
        Self {
            guard,
            handler: Arc::new(handler),
        }
    }

    /// Process one text frame and produce its reply.
    pub async fn process_frame(&self, text: &str) -> MessageReply {
        let payload = match serde_json::from_str::<Value>(text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to parse WebSocket message");
                return MessageReply::Error {
                    correlation_id: generate_correlation_id(Some("ws")),
                    message_id: generate_message_id(),
                    message: format!("invalid JSON: {e}"),
                };
            }
        };

        let handler = &self.handler;
        self.guard
            .handle(payload, |payload| handler.handle(payload))
            .await
    }
}

impl<S: Clone, H> Clone for WsState<S, H> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

/// WebSocket upgrade handler.
///
/// # Example
///
/// ```ignore
/// use axum::{Router, routing::get};
/// use idempotency_web::handlers::websocket;
///
/// let app = Router::new()
///     .route("/ws", get(websocket::handle::<RedisStore, SeatHandler>))
///     .with_state(WsState::new(message_guard, SeatHandler));
/// ```
#[allow(clippy::unused_async)] // Axum handler signature requires async
pub async fn handle<S, H>(ws: WebSocketUpgrade, State(state): State<WsState<S, H>>) -> Response
where
    S: KeyValueStore,
    H: MessageHandler,
{
    info!("WebSocket connection requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket<S, H>(socket: WebSocket, state: WsState<S, H>)
where
    S: KeyValueStore,
    H: MessageHandler,
{
    info!("WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let reply = state.process_frame(&text).await;
                let message = match serde_json::to_string(&reply) {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize reply");
                        continue;
                    }
                };
                if sender.send(message).await.is_err() {
                    debug!("Client disconnected before reply");
                    break;
                }
            }
            Message::Binary(_) => {
                warn!("Received unexpected binary message");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                info!("Client requested close");
                break;
            }
        }
    }

    info!("WebSocket connection closed");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/panic
mod tests {
    use super::*;
    use idempotency_core::IdempotencyConfig;
    use crate::AppState;
    use idempotency_testing::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct SeatHandler {
        calls: AtomicUsize,
    }

    impl MessageHandler for SeatHandler {
        async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match payload.get("seat").and_then(Value::as_str) {
                Some(seat) => Ok(json!({"held": seat, "hold": n})),
                None => Err(HandlerError::Validation("seat is required".to_string())),
            }
        }
    }

    fn app_state() -> AppState<InMemoryStore> {
        AppState::new(InMemoryStore::new(), IdempotencyConfig::new("ws-test"))
    }

    fn state_over(app: &AppState<InMemoryStore>) -> WsState<InMemoryStore, SeatHandler> {
        WsState::new(app.message_guard(), SeatHandler::default())
    }

    fn state() -> WsState<InMemoryStore, SeatHandler> {
        state_over(&app_state())
    }

    #[tokio::test]
    async fn test_repeated_frame_is_replayed() {
        let state = state();
        let frame = r#"{"idempotencyKey":"hold-A1","seat":"A1"}"#;

        let first = state.process_frame(frame).await;
        let second = state.process_frame(frame).await;

        let MessageReply::Result { data, .. } = first else {
            panic!("expected result, got {first:?}");
        };
        assert_eq!(data, json!({"held": "A1", "hold": 1}));
        assert!(matches!(
            second,
            MessageReply::AlreadyProcessed { ref data, .. } if data == &json!({"held": "A1", "hold": 1})
        ));
        assert_eq!(state.handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_frame_is_recorded_under_its_correlation() {
        let app = app_state();
        let state = state_over(&app);

        state
            .process_frame(r#"{"idempotencyKey":"hold-B1","correlationId":"flow-3","type":"HoldSeat","seat":"B1"}"#)
            .await;

        let chain = app.correlation().get_event_chain("flow-3").await;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].event_type, "HoldSeat");
        assert_eq!(chain[0].service, "ws");
        let metadata = app.correlation().get_metadata("flow-3").await.unwrap();
        assert_eq!(metadata.service.as_deref(), Some("ws"));
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error_reply() {
        let reply = state().process_frame("{not json").await;

        let MessageReply::Error { message, correlation_id, .. } = reply else {
            panic!("expected error, got {reply:?}");
        };
        assert!(message.starts_with("invalid JSON"));
        assert!(correlation_id.starts_with("ws-"));
    }

    #[tokio::test]
    async fn test_handler_failure_is_an_error_reply() {
        let state = state();
        let reply = state
            .process_frame(r#"{"idempotencyKey":"hold-none","correlationId":"corr-9"}"#)
            .await;

        assert_eq!(reply.correlation_id(), "corr-9");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "error");
    }
}
