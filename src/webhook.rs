//! Inbound webhook listener
//!
//! `POST /webhook` accepts `{type, signature, payload}` and forwards it to
//! the daemon over an mpsc channel. `GET /health` is for load balancers.

use crate::error::Result;
use crate::types::InboundWebhook;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Clone)]
struct ListenerState {
    tx: mpsc::Sender<InboundWebhook>,
    bearer_token: Option<String>,
}

/// Routes for the listener
pub fn router(tx: mpsc::Sender<InboundWebhook>, bearer_token: Option<String>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(receive))
        .with_state(ListenerState { tx, bearer_token })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn authorized(headers: &HeaderMap, expected: &Option<String>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let candidate = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .trim();
    !expected.is_empty() && candidate == expected
}

async fn receive(
    State(state): State<ListenerState>,
    headers: HeaderMap,
    Json(event): Json<InboundWebhook>,
) -> impl IntoResponse {
    if !authorized(&headers, &state.bearer_token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized" })),
        );
    }
    if event.event_type.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "type is required" })),
        );
    }

    debug!("Webhook received: {}", event.event_type);
    if state.tx.send(event).await.is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "daemon is shutting down" })),
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    )
}

/// A running listener
pub struct WebhookListener {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl WebhookListener {
    /// Bind `addr` (e.g. `127.0.0.1:8787`, port 0 picks a free one) and serve
    pub async fn bind(
        addr: &str,
        bearer_token: Option<String>,
        tx: mpsc::Sender<InboundWebhook>,
    ) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = router(tx, bearer_token);
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("Webhook listener failed: {}", e);
            }
        });

        info!("Webhook listener on http://{}", local_addr);
        Ok(Self {
            addr: local_addr,
            shutdown: Some(shutdown_tx),
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for the server task
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
        info!("Webhook listener stopped");
    }
}
