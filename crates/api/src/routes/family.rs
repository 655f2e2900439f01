//! Family onboarding and the entitlement preflight

use axum::{extract::State, http::StatusCode, Json};
use chorequest_billing::FamilyBilling;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::{
    auth::{AuthUser, CurrentFamily, Principal},
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_FAMILY_NAME_LENGTH: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CreateFamilyRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct FamilyResponse {
    pub id: Uuid,
    pub name: String,
    pub subscription_status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct EntitlementResponse {
    pub family_id: Uuid,
    pub status: String,
    pub entitled: bool,
    pub gate_enforced: bool,
    pub free_child_limit: i64,
}

/// First family the principal belongs to
pub async fn resolve_family(state: &AppState, principal: &Principal) -> ApiResult<FamilyBilling> {
    state
        .families
        .family_for_user(principal.id)
        .await?
        .ok_or_else(|| ApiError::BadRequest("User is not a member of any family".to_string()))
}

/// POST /api/families
///
/// Hosted deployment only. The creator becomes a parent member and the
/// family starts with a trial of `TRIAL_DAYS`.
pub async fn create_family(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Json(req): Json<CreateFamilyRequest>,
) -> ApiResult<(StatusCode, Json<FamilyResponse>)> {
    if !state.config.is_federated() {
        return Err(ApiError::NotFound(
            "Not available in self-hosted mode".to_string(),
        ));
    }

    let name = req.name.trim();
    if name.is_empty() || name.chars().count() > MAX_FAMILY_NAME_LENGTH {
        return Err(ApiError::BadRequest(format!(
            "Family name must be between 1 and {} characters",
            MAX_FAMILY_NAME_LENGTH
        )));
    }

    if state.families.family_for_user(principal.id).await?.is_some() {
        return Err(ApiError::Conflict(
            "You already belong to a family".to_string(),
        ));
    }

    let trial_ends_at = OffsetDateTime::now_utc() + Duration::days(state.config.trial_days);
    let family = state
        .families
        .create_family(name, principal.id, trial_ends_at)
        .await?;

    tracing::info!(family_id = %family.id, user_id = %principal.id, "Family created");

    Ok((
        StatusCode::CREATED,
        Json(FamilyResponse {
            id: family.id,
            name: name.to_string(),
            subscription_status: family.status.to_string(),
            trial_ends_at: family.trial_ends_at,
        }),
    ))
}

/// GET /api/family/entitlement
///
/// Sits behind the subscription gate, so reaching the handler means the
/// family may proceed with gated work.
pub async fn entitlement(
    State(state): State<AppState>,
    CurrentFamily(family): CurrentFamily,
) -> Json<EntitlementResponse> {
    let status = state.billing.subscription_status(&family);
    Json(EntitlementResponse {
        family_id: family.id,
        status: status.to_string(),
        entitled: status.grants_access() || family.is_entitled(OffsetDateTime::now_utc()),
        gate_enforced: state.gate.is_enforced(),
        free_child_limit: state.gate.free_child_limit(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::{header::AUTHORIZATION, Method, StatusCode};
    use chorequest_billing::SubscriptionStatus;
    use serde_json::json;

    use crate::auth::principal::Role;
    use crate::routes::create_router;
    use crate::test_support::{local_app, local_config, send, TestApp};

    fn federated_gated(app: &mut TestApp) {
        // Local provider keeps tests free of an identity issuer
        app.state.config = std::sync::Arc::new(crate::test_support::federated_config(&[
            ("TRIAL_DAYS", "14"),
            ("FREE_CHILD_LIMIT", "1"),
        ]));
        app.state.gate = chorequest_billing::SubscriptionGate::new(true, 1);
    }

    #[tokio::test]
    async fn test_create_family_starts_trial() {
        let mut app = local_app(local_config(&[]));
        federated_gated(&mut app);
        let owner = app.principals.insert("owner@example.com", Role::Admin, true);
        let auth = format!("Bearer {}", app.access_token(&owner));

        let (status, _, body) = send(
            create_router(app.state.clone()),
            Method::POST,
            "/api/families",
            Some(json!({"name": "  The Smiths "})),
            &[(AUTHORIZATION.as_str(), &auth)],
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "The Smiths");
        assert_eq!(body["subscription_status"], "none");
        assert!(body["trial_ends_at"].is_string());

        let (status, _, _) = send(
            create_router(app.state.clone()),
            Method::POST,
            "/api/families",
            Some(json!({"name": "Second"})),
            &[(AUTHORIZATION.as_str(), &auth)],
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_create_family_unavailable_in_local_mode() {
        let app = local_app(local_config(&[]));
        let owner = app.principals.insert("owner", Role::Admin, true);

        let (status, _, _) = send(
            create_router(app.state.clone()),
            Method::POST,
            "/api/families",
            Some(json!({"name": "Home"})),
            &[(AUTHORIZATION.as_str(), &format!("Bearer {}", app.access_token(&owner)))],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_entitlement_preflight() {
        let mut app = local_app(local_config(&[]));
        federated_gated(&mut app);
        let parent = app.principals.insert("mum", Role::Parent, true);
        let family = app.families.add(parent.id, SubscriptionStatus::None, None, 2);
        let auth = format!("Bearer {}", app.access_token(&parent));

        let (status, _, body) = send(
            create_router(app.state.clone()),
            Method::GET,
            "/api/family/entitlement",
            None,
            &[(AUTHORIZATION.as_str(), &auth)],
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["child_count"], 2);

        app.families.set_status(family.id, SubscriptionStatus::Active);
        let (status, _, body) = send(
            create_router(app.state.clone()),
            Method::GET,
            "/api/family/entitlement",
            None,
            &[(AUTHORIZATION.as_str(), &auth)],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gate_enforced"], true);
        assert_eq!(body["free_child_limit"], 1);
    }
}
