//! Authentication middleware and extractors
//!
//! `require_auth` resolves the caller through the configured provider and
//! stores the [`Principal`] in request extensions. Role guards and the
//! subscription gate are layered inside it and read that extension.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chorequest_billing::FamilyBilling;
use time::OffsetDateTime;

use super::principal::{Principal, Role};
use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated caller, available to handlers behind `require_auth`
#[derive(Debug, Clone)]
pub struct AuthUser(pub Principal);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(AuthUser)
            .ok_or(ApiError::Unauthenticated)
    }
}

/// Family the caller belongs to, set by `require_subscription`
#[derive(Debug, Clone)]
pub struct CurrentFamily(pub FamilyBilling);

impl<S> FromRequestParts<S> for CurrentFamily
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<FamilyBilling>()
            .cloned()
            .map(CurrentFamily)
            .ok_or_else(|| ApiError::BadRequest("User is not a member of any family".to_string()))
    }
}

/// Client address used in per-client rate-limit keys.
///
/// The socket peer, unless `TRUST_PROXY_HEADERS` says a reverse proxy in
/// front of the server overwrites the forwarding headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddress(pub String);

impl FromRequestParts<AppState> for ClientAddress {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(ClientAddress(client_address(
            &parts.headers,
            peer,
            state.config.trust_proxy_headers,
        )))
    }
}

pub fn client_address(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(forwarded) = forwarded_address(headers) {
            return forwarded;
        }
    }
    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Address reported by a reverse proxy, if any
pub fn forwarded_address(headers: &HeaderMap) -> Option<String> {
    // X-Forwarded-For may carry a chain; the first entry is the client
    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|h| h.to_str().ok()) {
        if let Some(first) = xff.split(',').map(str::trim).find(|ip| !ip.is_empty()) {
            return Some(first.to_string());
        }
    }
    ["CF-Connecting-IP", "X-Real-IP"].into_iter().find_map(|header| {
        headers
            .get(header)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(String::from)
    })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match state.auth.get_current_user(request.headers()).await {
        Ok(principal) => {
            tracing::debug!(
                path = %path,
                user_id = %principal.id,
                role = %principal.role,
                "require_auth: authenticated"
            );
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(path = %path, error = %err, "require_auth: rejected");
            err.into_response()
        }
    }
}

async fn require_role(
    request: Request,
    next: Next,
    allowed: fn(Role) -> bool,
    denial: &'static str,
) -> Response {
    let Some(principal) = request.extensions().get::<Principal>() else {
        return ApiError::Unauthenticated.into_response();
    };

    if !allowed(principal.role) {
        tracing::info!(
            user_id = %principal.id,
            role = %principal.role,
            path = %request.uri().path(),
            "Role check failed"
        );
        return ApiError::Forbidden(denial).into_response();
    }

    next.run(request).await
}

/// Parents and admins
pub async fn require_parent(request: Request, next: Next) -> Response {
    require_role(request, next, |role| role.is_guardian(), "Parent access required").await
}

pub async fn require_admin(request: Request, next: Next) -> Response {
    require_role(request, next, |role| role == Role::Admin, "Admin access required").await
}

pub async fn require_kid(request: Request, next: Next) -> Response {
    require_role(request, next, |role| role == Role::Kid, "Kid access required").await
}

/// Run the subscription gate for the caller's family.
///
/// Re-evaluated on every request. In the self-hosted deployment the gate is
/// disabled and this only resolves the family.
pub async fn require_subscription(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(principal) = request.extensions().get::<Principal>().cloned() else {
        return ApiError::Unauthenticated.into_response();
    };

    let family = match state.families.family_for_user(principal.id).await {
        Ok(Some(family)) => family,
        Ok(None) => {
            return ApiError::BadRequest("User is not a member of any family".to_string())
                .into_response()
        }
        Err(err) => return ApiError::from(err).into_response(),
    };

    if state.gate.is_enforced() {
        let child_count = match state.families.child_count(family.id).await {
            Ok(count) => count,
            Err(err) => return ApiError::from(err).into_response(),
        };

        if let Err(required) = state
            .gate
            .check(&family, child_count, OffsetDateTime::now_utc())
        {
            tracing::info!(
                family_id = %family.id,
                child_count,
                free_limit = required.free_limit,
                "Subscription required"
            );
            return ApiError::from(required).into_response();
        }
    }

    request.extensions_mut().insert(family);
    next.run(request).await
}
