//! HTTP surface
//!
//! Two WebSocket endpoints: one for the machine being enrolled and one for
//! the trusted device answering a challenge. The responder endpoint requires
//! a valid bearer token before the upgrade; the enrollment endpoint is
//! deliberately open.

pub mod handshake;

use axum::Router;
use axum::routing::get;

use crate::auth::Authenticator;
use crate::pairing::HandshakeContext;

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub ctx: HandshakeContext,
    pub auth: Authenticator,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/machines/register", get(handshake::register))
        .route("/api/challenge/respond", get(handshake::respond))
        .with_state(state)
}
