//! HTTP routes

pub mod auth;
pub mod billing;
pub mod family;
pub mod health;
pub mod ws;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};

use crate::{
    auth::{require_auth, require_parent, require_subscription},
    state::AppState,
};

/// Build the application router.
///
/// Password, PIN and registration routes exist only in the self-hosted
/// deployment; elsewhere they fall through to 404.
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/config", get(health::public_config))
        .route("/api/billing/webhook", post(billing::webhook))
        .route("/ws/{user_id}", get(ws::ws_handler));

    let local_auth = if state.config.is_federated() {
        Router::new()
    } else {
        Router::new()
            .route("/api/auth/login", post(auth::login))
            .route("/api/auth/pin-login", post(auth::pin_login))
            .route("/api/auth/register", post(auth::register))
            .route("/api/auth/refresh", post(auth::refresh))
            .route("/api/auth/logout", post(auth::logout))
    };

    let parent_only = Router::new()
        .route("/api/billing/checkout", post(billing::checkout))
        .route_layer(from_fn(require_parent));

    let gated = Router::new()
        .route("/api/family/entitlement", get(family::entitlement))
        .route_layer(from_fn_with_state(state.clone(), require_subscription));

    let protected = Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/billing/status", get(billing::status))
        .route("/api/families", post(family::create_family))
        .merge(parent_only)
        .merge(gated)
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(local_auth)
        .merge(protected)
        .with_state(state)
}
