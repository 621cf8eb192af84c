//! WebSocket upgrade handlers for the pairing handshake

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::bearer_token;
use crate::pairing::{handle_challenge_response, handle_new_machine};
use crate::transport::WsStream;

/// `GET /api/machines/register`
///
/// Upgrade for the machine asking to be enrolled. Unauthenticated; the
/// handshake itself establishes trust.
pub async fn register(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let conn_id = Uuid::new_v4();
    ws.on_upgrade(move |socket| async move {
        let mut stream = WsStream::new(socket);
        if let Err(e) = handle_new_machine(&state.ctx, &mut stream).await {
            warn!(%conn_id, error = %e, "enrollment connection ended with error");
        }
    })
}

/// `GET /api/challenge/respond`
///
/// Upgrade for the trusted device answering a challenge. The bearer token
/// is verified before the upgrade; anything short of a valid token from an
/// enrolled machine gets 401.
pub async fn respond(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let token = match bearer_token(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    ) {
        Ok(token) => token,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let authed = match state.auth.authenticate(token) {
        Ok(authed) => authed,
        Err(e) => {
            info!(error = %e, "responder authentication failed");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        let mut stream = WsStream::new(socket);
        if let Err(e) =
            handle_challenge_response(&state.ctx, &mut stream, &authed.username).await
        {
            warn!(
                responder = %authed.username,
                error = %e,
                "responder connection ended with error"
            );
        }
    })
    .into_response()
}
