//! Local-mode authentication routes
//!
//! Login, PIN login and registration are throttled per client address.
//! Login and PIN login are also throttled per account, whatever address the
//! attempts come from. These routes are only mounted in the
//! self-hosted deployment; the hosted deployment signs users in through the
//! identity provider.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::{
        password::CredentialHasher, principal::NewPrincipal, refresh::IssuedSession, AuthUser,
        ClientAddress, Principal, Role,
    },
    error::{ApiError, ApiResult},
    state::AppState,
};

const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_USERNAME_LENGTH: usize = 64;

// =============================================================================
// Rate-limit keys
// =============================================================================

pub fn login_rate_key(ip: &str) -> String {
    format!("login:{}", ip)
}

pub fn login_account_rate_key(username: &str) -> String {
    format!("login-account:{}", username.trim().to_lowercase())
}

pub fn pin_rate_key(ip: &str) -> String {
    format!("pin:{}", ip)
}

pub fn pin_account_rate_key(user_id: Uuid) -> String {
    format!("pin-account:{}", user_id)
}

pub fn register_rate_key(ip: &str) -> String {
    format!("register:{}", ip)
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct PinLoginRequest {
    pub user_id: Uuid,
    pub pin: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub refresh_expires_at: OffsetDateTime,
    pub user: Principal,
}

impl SessionResponse {
    fn new(session: IssuedSession, user: Principal) -> Self {
        Self {
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            token_type: "bearer",
            refresh_expires_at: session.refresh_expires_at,
            user,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

// =============================================================================
// Helpers
// =============================================================================

/// Argon2 verification off the async runtime threads.
///
/// With no stored hash the work is still done, against a decoy.
async fn verify_secret(
    hasher: CredentialHasher,
    secret: String,
    hash: Option<String>,
) -> ApiResult<bool> {
    tokio::task::spawn_blocking(move || match hash {
        Some(hash) => hasher.verify(&secret, &hash),
        None => hasher.verify_absent(&secret),
    })
    .await
    .map_err(|e| ApiError::Internal(format!("verification task failed: {}", e)))
}

/// Consume one attempt from each window; the first full one rejects.
fn check_limits(state: &AppState, keys: &[String], max_requests: usize) -> ApiResult<()> {
    for key in keys {
        state
            .rate_limiter
            .check(key, max_requests, state.config.rate_limit_window_seconds)?;
    }
    Ok(())
}

async fn hash_secret(hasher: CredentialHasher, secret: String) -> ApiResult<String> {
    tokio::task::spawn_blocking(move || hasher.hash(&secret))
        .await
        .map_err(|e| ApiError::Internal(format!("hashing task failed: {}", e)))?
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn open_session(state: &AppState, principal: Principal) -> ApiResult<Json<SessionResponse>> {
    let session = state.refresh.start_session(&principal).await?;
    Ok(Json(SessionResponse::new(session, principal)))
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    ClientAddress(ip): ClientAddress,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<SessionResponse>> {
    check_limits(
        &state,
        &[login_rate_key(&ip), login_account_rate_key(&req.username)],
        state.config.login_rate_limit_max,
    )?;

    let principal = state.principals.find_by_username(req.username.trim()).await?;
    let password_hash = match &principal {
        Some(principal) => state
            .principals
            .credentials(principal.id)
            .await?
            .map(|credentials| credentials.password_hash),
        None => None,
    };

    let verified = verify_secret(state.hasher.clone(), req.password, password_hash).await?;
    let principal = match principal {
        Some(principal) if verified => principal,
        Some(principal) => {
            tracing::info!(user_id = %principal.id, ip = %ip, "Password login failed");
            return Err(ApiError::Unauthenticated);
        }
        None => return Err(ApiError::Unauthenticated),
    };

    if !principal.is_active {
        return Err(ApiError::AccountInactive);
    }

    tracing::info!(user_id = %principal.id, "Password login succeeded");
    open_session(&state, principal).await
}

/// POST /api/auth/pin-login
pub async fn pin_login(
    State(state): State<AppState>,
    ClientAddress(ip): ClientAddress,
    Json(req): Json<PinLoginRequest>,
) -> ApiResult<Json<SessionResponse>> {
    check_limits(
        &state,
        &[pin_rate_key(&ip), pin_account_rate_key(req.user_id)],
        state.config.pin_rate_limit_max,
    )?;

    let principal = state.principals.find_by_id(req.user_id).await?;
    let pin_hash = match &principal {
        Some(principal) => state
            .principals
            .credentials(principal.id)
            .await?
            .and_then(|credentials| credentials.pin_hash),
        None => None,
    };

    let verified = verify_secret(state.hasher.clone(), req.pin, pin_hash).await?;
    let principal = match principal {
        Some(principal) if verified => principal,
        Some(principal) => {
            tracing::info!(user_id = %principal.id, ip = %ip, "PIN login failed");
            return Err(ApiError::Unauthenticated);
        }
        None => return Err(ApiError::Unauthenticated),
    };

    if !principal.is_active {
        return Err(ApiError::AccountInactive);
    }

    open_session(&state, principal).await
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    ClientAddress(ip): ClientAddress,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    if !state.config.registration_enabled {
        return Err(ApiError::Forbidden("Registration is disabled"));
    }

    check_limits(
        &state,
        &[register_rate_key(&ip)],
        state.config.register_rate_limit_max,
    )?;

    let username = req.username.trim().to_string();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(ApiError::BadRequest(format!(
            "Username must be between 1 and {} characters",
            MAX_USERNAME_LENGTH
        )));
    }
    if req.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    let display_name = req
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| username.clone());

    let password_hash = hash_secret(state.hasher.clone(), req.password).await?;

    let principal = state
        .principals
        .create(NewPrincipal {
            username,
            display_name,
            password_hash,
            role: Role::Parent,
            external_id: None,
        })
        .await?
        .ok_or_else(|| ApiError::Conflict("Username is already taken".to_string()))?;

    tracing::info!(user_id = %principal.id, "Registered new account");
    let Json(session) = open_session(&state, principal).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// POST /api/auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<AccessTokenResponse>> {
    let access_token = state.refresh.redeem(&req.refresh_token).await?;
    Ok(Json(AccessTokenResponse {
        access_token,
        token_type: "bearer",
    }))
}

/// POST /api/auth/logout
pub async fn logout(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<StatusCode> {
    state.refresh.revoke(&req.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/auth/me
pub async fn me(AuthUser(principal): AuthUser) -> Json<Principal> {
    Json(principal)
}
