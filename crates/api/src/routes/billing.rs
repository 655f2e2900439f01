//! Billing routes
//!
//! Status is served from the family row; only checkout talks to the billing
//! provider on the request path. The webhook is unauthenticated and trusts
//! nothing that fails signature verification.

use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::family::resolve_family,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionStatusResponse {
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    pub entitled: bool,
}

/// GET /api/billing/status
pub async fn status(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
) -> ApiResult<Json<SubscriptionStatusResponse>> {
    let family = resolve_family(&state, &principal).await?;
    let status = state.billing.subscription_status(&family);

    Ok(Json(SubscriptionStatusResponse {
        status: status.to_string(),
        current_period_end: family.current_period_end,
        trial_ends_at: family.trial_ends_at,
        entitled: status.grants_access() || family.is_entitled(OffsetDateTime::now_utc()),
    }))
}

/// POST /api/billing/checkout (parents only)
pub async fn checkout(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    if !state.config.is_federated() {
        return Err(ApiError::NotFound(
            "Billing is not available in self-hosted mode".to_string(),
        ));
    }

    let family = resolve_family(&state, &principal).await?;
    let session = state
        .billing
        .create_checkout_session(family.id, &req.success_url, &req.cancel_url)
        .await?;

    tracing::info!(family_id = %family.id, user_id = %principal.id, "Checkout session created");
    Ok(Json(CheckoutResponse {
        url: session.url,
        session_id: session.session_id,
    }))
}

/// POST /api/billing/webhook
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: String,
) -> ApiResult<Json<Value>> {
    if !state.config.is_federated() {
        return Err(ApiError::NotFound("Not found".to_string()));
    }

    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    state
        .billing
        .handle_webhook(&payload, signature)
        .await
        .map_err(|err| {
            tracing::warn!(error = %err, "Webhook rejected");
            ApiError::BadRequest("Webhook processing failed".to_string())
        })?;

    Ok(Json(json!({ "received": true })))
}
