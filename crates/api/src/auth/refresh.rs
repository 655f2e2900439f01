//! Refresh credential lifecycle
//!
//! A refresh token is only honoured while both its signature verifies and a
//! row keyed by its SHA-256 hash exists, so deleting rows revokes tokens that
//! would otherwise stay valid until their embedded expiry. The raw token is
//! never stored.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::jwt::TokenCodec;
use super::principal::{Principal, PrincipalStore};
use crate::error::{ApiError, ApiResult};

/// SHA-256 hex digest of a presented refresh token
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Persistence for hashed refresh credentials
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(
        &self,
        token_hash: &str,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error>;

    /// Owner of an unexpired credential with this hash
    async fn find_valid(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, sqlx::Error>;

    async fn delete(&self, token_hash: &str) -> Result<bool, sqlx::Error>;

    /// Remove every credential that expired before `now`
    async fn delete_expired(&self, now: OffsetDateTime) -> Result<u64, sqlx::Error>;
}

#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn insert(
        &self,
        token_hash: &str,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_hash, user_id, expires_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(token_hash)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_valid(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT user_id FROM refresh_tokens WHERE token_hash = $1 AND expires_at > $2",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
    }

    async fn delete(&self, token_hash: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Tokens handed out at login
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_expires_at: OffsetDateTime,
}

/// Issues, redeems and revokes refresh credentials
#[derive(Clone)]
pub struct RefreshTokenService {
    codec: TokenCodec,
    store: Arc<dyn RefreshTokenStore>,
    principals: Arc<dyn PrincipalStore>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl RefreshTokenService {
    pub fn new(
        codec: TokenCodec,
        store: Arc<dyn RefreshTokenStore>,
        principals: Arc<dyn PrincipalStore>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            codec,
            store,
            principals,
            access_ttl,
            refresh_ttl,
        }
    }

    /// Mint a refresh token for the principal and persist its hash
    pub async fn issue(&self, principal: &Principal) -> Result<(String, OffsetDateTime), sqlx::Error> {
        let (token, expires_at) = self.codec.issue_refresh(principal.id, self.refresh_ttl);
        self.store
            .insert(&hash_token(&token), principal.id, expires_at)
            .await?;
        tracing::debug!(user_id = %principal.id, "Issued refresh credential");
        Ok((token, expires_at))
    }

    /// Access plus refresh token for a freshly authenticated principal
    pub async fn start_session(&self, principal: &Principal) -> Result<IssuedSession, sqlx::Error> {
        let access_token = self
            .codec
            .issue_access(principal.id, principal.role, self.access_ttl);
        let (refresh_token, refresh_expires_at) = self.issue(principal).await?;
        Ok(IssuedSession {
            access_token,
            refresh_token,
            refresh_expires_at,
        })
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// Every failure, whether signature, expiry, missing row or inactive
    /// owner, surfaces as `Unauthenticated`.
    pub async fn redeem(&self, token: &str) -> ApiResult<String> {
        let claims = self.codec.decode_refresh(token).map_err(|err| {
            tracing::debug!(error = %err, "Refresh token rejected");
            ApiError::Unauthenticated
        })?;

        let owner = self
            .store
            .find_valid(&hash_token(token), OffsetDateTime::now_utc())
            .await?
            .ok_or_else(|| {
                tracing::debug!(user_id = %claims.sub, "Refresh credential not found or revoked");
                ApiError::Unauthenticated
            })?;

        if owner != claims.sub {
            tracing::warn!(user_id = %claims.sub, "Refresh credential owner mismatch");
            return Err(ApiError::Unauthenticated);
        }

        let principal = self
            .principals
            .find_by_id(owner)
            .await?
            .filter(|p| p.is_active)
            .ok_or(ApiError::Unauthenticated)?;

        Ok(self
            .codec
            .issue_access(principal.id, principal.role, self.access_ttl))
    }

    /// Delete the credential for a presented token. Returns whether a row existed.
    pub async fn revoke(&self, token: &str) -> Result<bool, sqlx::Error> {
        self.store.delete(&hash_token(token)).await
    }
}

/// Delete every refresh credential past its expiry.
///
/// Delete-only, so it is safe to run while requests issue new credentials.
pub async fn sweep_expired(
    store: &dyn RefreshTokenStore,
    now: OffsetDateTime,
) -> Result<u64, sqlx::Error> {
    let removed = store.delete_expired(now).await?;
    if removed > 0 {
        tracing::info!(removed, "Swept expired refresh credentials");
    }
    Ok(removed)
}
