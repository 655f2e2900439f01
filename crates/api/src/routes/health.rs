//! Health check and public client configuration

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /api/config
///
/// Unauthenticated. Tells the frontend which sign-in flow to use and, in the
/// hosted deployment, the public Firebase client settings.
pub async fn public_config(State(state): State<AppState>) -> Json<Value> {
    let mut body = json!({ "app_mode": state.config.app_mode.as_str() });

    if let Some(firebase) = &state.config.firebase {
        body["firebase"] = json!({
            "apiKey": firebase.web_api_key,
            "projectId": firebase.project_id,
            "authDomain": format!("{}.firebaseapp.com", firebase.project_id),
        });
    }

    Json(body)
}
