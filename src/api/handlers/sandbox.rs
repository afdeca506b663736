//! Sandbox session and status handlers.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use sandboxd_protocol::{encode_event, MAX_FRAME_SIZE};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{ApiErrorResponse, ConnectQuery, SandboxStatus, StatusQuery};
use crate::api::validation::{resolve_username, validate_resource_name, MAX_USERNAME_LEN};
use crate::os::OsFlavor;
use crate::session::SessionController;

/// Inbound frames buffered per connection.
const INBOUND_BUFFER: usize = 64;

/// Open a sandbox session.
///
/// Upgrades to a websocket speaking the JSON session protocol. The user
/// comes from the `x-sandbox-user` header, else the `username` cookie,
/// else `guest`.
#[utoipa::path(
    get,
    path = "/ws/sandbox",
    tag = "Sessions",
    params(ConnectQuery),
    responses(
        (status = 101, description = "Switching to the session protocol"),
        (status = 400, description = "Invalid username", body = ApiErrorResponse)
    )
)]
pub async fn connect(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let username = resolve_username(&headers)?;
    let initial_os = query.os.as_deref().map(OsFlavor::normalize);

    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| serve_socket(state, socket, username, initial_os)))
}

/// Pump frames between a websocket and a session controller.
async fn serve_socket(
    state: Arc<ApiState>,
    socket: WebSocket,
    username: String,
    initial_os: Option<OsFlavor>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(state.outbound_buffer());

    let controller =
        SessionController::new(state.services().clone(), username.clone(), initial_os, outbound_tx);
    let session = tokio::spawn(controller.run(inbound_rx));

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let frame = match encode_event(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(incoming) = receiver.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(user = %username, error = %e, "websocket receive failed");
                break;
            }
        };
        let frame = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            // axum answers pings itself
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if inbound_tx.send(frame).await.is_err() {
            break;
        }
    }

    drop(inbound_tx);
    if let Err(e) = session.await {
        tracing::error!(user = %username, error = %e, "session task failed");
    }
    let _ = writer.await;
}

/// Report the container backing a user's sandbox.
///
/// Never creates a container.
#[utoipa::path(
    get,
    path = "/api/v1/sandbox/status",
    tag = "Sandboxes",
    params(StatusQuery),
    responses(
        (status = 200, description = "Sandbox record", body = SandboxStatus),
        (status = 400, description = "Invalid username", body = ApiErrorResponse),
        (status = 404, description = "No sandbox for this user and flavor", body = ApiErrorResponse)
    )
)]
pub async fn status(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<SandboxStatus>, ApiError> {
    validate_resource_name(&query.user, "user", MAX_USERNAME_LEN)?;
    let os = query
        .os
        .as_deref()
        .map(OsFlavor::normalize)
        .unwrap_or_default();

    let record = state.registry().get_record(&query.user, os).ok_or_else(|| {
        ApiError::NotFound(format!("no sandbox for {} ({})", query.user, os))
    })?;
    Ok(Json(SandboxStatus::from(&record)))
}
