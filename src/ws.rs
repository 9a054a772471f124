//! WebSocket push endpoint for repository status updates.
//!
//! Clients connect to `/ws/status?token=<jwt>`. Admission runs in order:
//! token verification, connect rate limiter, registry capacity. A rejected
//! channel is closed with a policy-violation (1008) or try-again-later
//! (1013) frame before any message exchange. Accepted channels sit in a
//! receive loop purely to notice disconnects; the server pushes through
//! the registry, never from this loop.

use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::SharedState;
use crate::auth::{self, TokenData};
use crate::connections::ConnectionRegistry;
use crate::models::AnalysisStatus;

/// Close code for authentication and rate-limit rejections.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for capacity rejections.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

// ── Status broadcasting ──────────────────────────────────────────────

/// Wire format of a status push: `{"id": 7, "status": "IN_PROGRESS"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: i64,
    pub status: AnalysisStatus,
}

/// Serialize a status change and fan it out through the registry.
///
/// Delivery is global: every connected client receives every repository's
/// status events, regardless of ownership. Owner-scoped delivery would go
/// through `ConnectionRegistry::send_personal` instead.
pub fn broadcast_status(registry: &ConnectionRegistry, repository_id: i64, status: AnalysisStatus) {
    let update = StatusUpdate {
        id: repository_id,
        status,
    };
    match serde_json::to_string(&update) {
        Ok(json) => registry.broadcast(&json),
        Err(e) => warn!("failed to serialize status update: {}", e),
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

/// Upgrade handler for `/ws/status` (and its versioned twin).
///
/// Token and rate-limit checks run before the upgrade so their outcome is
/// fixed by the time the socket exists; the close frame itself can only be
/// sent on the upgraded socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsAuthQuery>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let admission: Result<TokenData, (u16, String)> = match query.token.as_deref() {
        None => Err((
            CLOSE_POLICY_VIOLATION,
            "Missing authentication token".to_string(),
        )),
        Some(token) => match auth::verify_token(&state.config.secret_key, token) {
            Err(_) => Err((
                CLOSE_POLICY_VIOLATION,
                "Invalid authentication token".to_string(),
            )),
            Ok(user) => match state.limiter.check(&user.id.to_string()) {
                Err(e) => Err((CLOSE_POLICY_VIOLATION, e.to_string())),
                Ok(()) => Ok(user),
            },
        },
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, admission))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: SharedState,
    admission: Result<TokenData, (u16, String)>,
) {
    let user = match admission {
        Ok(user) => user,
        Err((code, reason)) => {
            close_with(&mut socket, code, &reason).await;
            return;
        }
    };
    let identity = user.id.to_string();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn_id = match state.registry.connect(&identity, tx) {
        Ok(id) => id,
        Err(e) => {
            close_with(&mut socket, CLOSE_TRY_AGAIN_LATER, &e.to_string()).await;
            return;
        }
    };
    info!("websocket connected for user {}", identity);

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            // ── Pushes from the registry ────────────────────────────
            msg = rx.recv() => {
                match msg {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Client frames: only watched to detect disconnect ────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("websocket error for user {}: {}", identity, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.registry.disconnect(&identity, conn_id);
    info!("websocket disconnected for user {}", identity);
    let _ = sender.send(Message::Close(None)).await;
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
