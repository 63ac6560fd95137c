//! Device registration endpoints and the live notification socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::error::ServiceError;
use crate::core::shared::state::AppState;
use crate::notifications::push::DeviceToken;
use crate::security::auth::AuthenticatedActor;

#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub token: String,
    pub platform: String,
}

pub async fn handle_device_register(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Json(request): Json<DeviceRequest>,
) -> Result<(StatusCode, Json<DeviceToken>), ServiceError> {
    let device = state
        .devices
        .register_device(&actor, &request.token, &request.platform)
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

pub async fn handle_device_unregister(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(token): Path<String>,
) -> Result<StatusCode, ServiceError> {
    state.devices.unregister_device(&actor, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn live_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
) -> impl IntoResponse {
    info!("Live notification socket requested by {}", actor.id);
    ws.on_upgrade(move |socket| handle_live_websocket(socket, state, actor.id))
}

async fn handle_live_websocket(socket: WebSocket, state: Arc<AppState>, recipient_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let mut notifications = state.live.subscribe(recipient_id).await;

    let welcome = serde_json::json!({
        "type": "connected",
        "recipient_id": recipient_id,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if sender.send(Message::Text(welcome.to_string())).await.is_err() {
        error!("Failed to greet live socket for {}", recipient_id);
        drop(notifications);
        state.live.release(recipient_id).await;
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    let Ok(json) = serde_json::to_string(&notification) else {
                        continue;
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        debug!("Live socket for {} went away", recipient_id);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Live socket for {} lagged behind by {} notifications", recipient_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    // The receiver must be dropped before `release` counts subscribers.
    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
            let _ = recv_task.await;
        }
        _ = (&mut recv_task) => {
            send_task.abort();
            let _ = send_task.await;
        }
    }

    state.live.release(recipient_id).await;
    info!("Live notification socket closed for {}", recipient_id);
}

pub fn configure_notification_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/devices", post(handle_device_register))
        .route("/api/devices/:token", delete(handle_device_unregister))
        .route("/api/notifications/live", get(live_websocket_handler))
}
