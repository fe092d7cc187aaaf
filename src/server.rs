// ABOUTME: HTTP surface: health, status snapshot, live WebSocket feed, metrics, notification intake
// ABOUTME: axum router over the shared repository, status watch and live event hub

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fieldbot_core::events::{EventHub, LiveEvent};
use fieldbot_core::metrics;
use fieldbot_core::repository::DispatchRepository;
use fieldbot_core::status::StatusSnapshot;
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Notification text larger than this is rejected
pub const MAX_NOTIFICATION_LENGTH: usize = 4 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn DispatchRepository>,
    pub status: watch::Receiver<Option<StatusSnapshot>>,
    pub events: EventHub,
    pub api_key: Option<String>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub recipient: String,
    pub message: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl EnqueueResponse {
    fn rejected(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: false,
                message: message.into(),
                id: None,
            }),
        )
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .route("/notifications", post(enqueue_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn start_server(addr: &str, state: AppState, cancel: CancellationToken) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
    tracing::info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("HTTP server failed")?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.status.borrow().clone();
    match snapshot {
        Some(snapshot) => (StatusCode::OK, Json(serde_json::to_value(snapshot).unwrap_or_default())),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no status published yet" })),
        ),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics disabled".to_string()),
    }
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Json(payload): Json<EnqueueRequest>,
) -> (StatusCode, Json<EnqueueResponse>) {
    if let Some(expected_key) = &state.api_key {
        match &payload.api_key {
            Some(provided_key) if provided_key == expected_key => {}
            _ => {
                tracing::warn!(recipient = %payload.recipient, "Notification intake authentication failed");
                metrics::record_error("api_auth");
                return EnqueueResponse::rejected(
                    StatusCode::UNAUTHORIZED,
                    "Invalid or missing API key",
                );
            }
        }
    }

    if payload.recipient.trim().is_empty() {
        return EnqueueResponse::rejected(StatusCode::BAD_REQUEST, "Recipient cannot be empty");
    }
    if payload.message.trim().is_empty() {
        return EnqueueResponse::rejected(StatusCode::BAD_REQUEST, "Message cannot be empty");
    }
    if payload.message.len() > MAX_NOTIFICATION_LENGTH {
        return EnqueueResponse::rejected(
            StatusCode::BAD_REQUEST,
            format!("Message too large (max {} bytes)", MAX_NOTIFICATION_LENGTH),
        );
    }

    match state
        .repo
        .enqueue_notification(payload.recipient.trim(), &payload.message)
        .await
    {
        Ok(id) => {
            tracing::info!(id, recipient = %payload.recipient, "Notification queued via HTTP");
            (
                StatusCode::ACCEPTED,
                Json(EnqueueResponse {
                    success: true,
                    message: "Notification queued".to_string(),
                    id: Some(id),
                }),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to queue notification");
            metrics::record_error("api_enqueue");
            EnqueueResponse::rejected(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to queue notification",
            )
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Push every live event to the client; the first frame is the latest snapshot
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let mut events = state.events.subscribe();

    let initial = state.status.borrow().clone();
    if let Some(snapshot) = initial {
        let event = LiveEvent::StatusSnapshot { data: snapshot };
        if send_event(&mut ws_sink, &event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if send_event(&mut ws_sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "WebSocket client lagging; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = ws_stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!("WebSocket connection closed");
}

async fn send_event<S>(sink: &mut S, event: &LiveEvent) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize live event");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}
