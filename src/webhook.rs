//! WhatsApp bridge webhook.
//!
//! The bridge pushes inbound messages and reaction batches as JSON posts.
//! This server decodes them into `ProviderEvent`s and forwards them to the
//! bot's event channel. Axum-based, with request tracing and graceful
//! shutdown.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc::UnboundedSender;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::provider::{BridgeEvent, ProviderEvent};

#[derive(Clone)]
struct WebhookState {
    events: UnboundedSender<ProviderEvent>,
}

/// Build the webhook router.
pub fn webhook_router(events: UnboundedSender<ProviderEvent>) -> Router {
    Router::new()
        .route("/webhook/whatsapp", post(receive_bridge_event))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(WebhookState { events })
}

/// Start the server and run until shutdown signal.
pub async fn run_webhook_server(
    addr: SocketAddr,
    events: UnboundedSender<ProviderEvent>,
) -> anyhow::Result<()> {
    let router = webhook_router(events);
    let listener = TcpListener::bind(addr).await?;
    info!("Webhook server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Webhook server shut down gracefully");
    Ok(())
}

async fn receive_bridge_event(
    State(state): State<WebhookState>,
    Json(event): Json<BridgeEvent>,
) -> StatusCode {
    let event = ProviderEvent::from(event);
    debug!("Webhook delivered {:?}", event);

    if state.events.send(event).is_err() {
        warn!("Event loop is gone, dropping webhook event");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
