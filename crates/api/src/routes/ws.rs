//! Real-time connection endpoint
//!
//! Browsers cannot set headers on a WebSocket handshake, so the token comes
//! in the `token` query parameter. It is checked once, when the connection
//! opens; a token that expires while the socket is open is not re-checked.
//! Both deployment modes resolve the token to an active principal and
//! require it to match the user id in the path.

use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::{Principal, ValidatedToken},
    state::AppState,
};

/// Close code sent when the connection token is rejected
pub const POLICY_CLOSE_CODE: u16 = 4001;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws/{user_id}?token=...
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state, user_id, query.token))
}

/// Principal for a connection token, if it belongs to `user_id`.
///
/// Unlike the HTTP path, a federated identity seen here for the first time is
/// not provisioned.
pub async fn authorize_connection(
    state: &AppState,
    token: Option<&str>,
    user_id: Uuid,
) -> Option<Principal> {
    let validated = state.auth.validate_token(token?).await?;

    let lookup = match &validated {
        ValidatedToken::Local(claims) => state.principals.find_by_id(claims.sub).await,
        ValidatedToken::Federated(identity) => {
            state.principals.find_by_external_id(&identity.uid).await
        }
    };

    let principal = match lookup {
        Ok(found) => found?,
        Err(err) => {
            tracing::error!(error = ?err, "Principal lookup failed for WebSocket connection");
            return None;
        }
    };

    (principal.id == user_id && principal.is_active).then_some(principal)
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user_id: Uuid, token: Option<String>) {
    let Some(principal) = authorize_connection(&state, token.as_deref(), user_id).await else {
        tracing::info!(user_id = %user_id, "WebSocket connection rejected");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_CLOSE_CODE,
                reason: Utf8Bytes::from_static("unauthorized"),
            })))
            .await;
        return;
    };

    tracing::info!(user_id = %principal.id, "WebSocket connected");

    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    tracing::info!(user_id = %principal.id, "WebSocket disconnected");
}
