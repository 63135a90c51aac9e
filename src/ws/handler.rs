use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthError;
use crate::error::GatewayError;
use crate::state::AppState;
use crate::ws::actor;

/// Connect-time query parameters. Auth is via `?token=` because browsers
/// cannot set headers on WebSocket upgrades.
#[derive(Debug, Deserialize)]
pub struct WsConnectQuery {
    pub token: Option<String>,
    /// Client-chosen reconnect identity; generated server-side if absent.
    pub connection_id: Option<String>,
    /// "true" marks a keepalive connection (long idle window, never evicts).
    pub keepalive: Option<String>,
}

/// WebSocket close codes for connect-time failures:
/// 4001 = no token supplied
/// 4002 = token invalid or expired
/// 4003 = verification backend error
const CLOSE_NO_TOKEN: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;
const CLOSE_AUTH_BACKEND: u16 = 4003;

/// GET /ws?token=...&connection_id=...&keepalive=true
/// On auth failure, upgrades then immediately closes with the matching close
/// code — no protocol frames are ever sent to an unauthenticated client.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.token else {
        tracing::warn!("WebSocket connect without token");
        return ws.on_upgrade(|socket| close_with(socket, CLOSE_NO_TOKEN, "No token provided"));
    };

    match state.verifier.verify(&token).await {
        Ok(user) => {
            let connection_id = params
                .connection_id
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let is_keepalive = params.keepalive.as_deref() == Some("true");

            tracing::info!(
                user_id = %user.user_id,
                connection_id = %connection_id,
                "WebSocket connection authenticated"
            );
            ws.on_upgrade(move |socket| {
                actor::run_connection(socket, state, user, connection_id, is_keepalive)
            })
        }
        Err(err) => {
            let (code, reason) = match err {
                AuthError::Expired => (CLOSE_TOKEN_INVALID, "Token expired"),
                AuthError::Invalid(_) => (CLOSE_TOKEN_INVALID, "Token invalid"),
                AuthError::Backend(_) => (CLOSE_AUTH_BACKEND, "Authentication error"),
            };
            let classified = GatewayError::Authentication(err.to_string());
            tracing::warn!(close_code = code, error = %classified, "WebSocket auth failed");
            ws.on_upgrade(move |socket| close_with(socket, code, reason))
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
