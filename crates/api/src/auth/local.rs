//! Self-hosted provider: locally issued access tokens

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;

use super::jwt::TokenCodec;
use super::principal::{Principal, PrincipalStore};
use super::provider::{extract_bearer_token, AuthProvider, ValidatedToken};
use crate::error::{ApiError, ApiResult};

pub struct LocalAuthProvider {
    codec: TokenCodec,
    principals: Arc<dyn PrincipalStore>,
}

impl LocalAuthProvider {
    pub fn new(codec: TokenCodec, principals: Arc<dyn PrincipalStore>) -> Self {
        Self { codec, principals }
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    async fn get_current_user(&self, headers: &HeaderMap) -> ApiResult<Principal> {
        let token = extract_bearer_token(headers).ok_or(ApiError::Unauthenticated)?;

        let claims = self.codec.decode_access(token).map_err(|err| {
            tracing::debug!(error = %err, "Access token rejected");
            ApiError::Unauthenticated
        })?;

        let principal = self
            .principals
            .find_by_id(claims.sub)
            .await?
            .ok_or(ApiError::Unauthenticated)?;

        if !principal.is_active {
            tracing::warn!(user_id = %principal.id, "Inactive account presented a valid token");
            return Err(ApiError::AccountInactive);
        }

        Ok(principal)
    }

    async fn validate_token(&self, token: &str) -> Option<ValidatedToken> {
        self.codec.decode_access(token).ok().map(ValidatedToken::Local)
    }
}
