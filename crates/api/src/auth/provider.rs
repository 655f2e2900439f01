//! Authentication provider abstraction
//!
//! One provider is chosen at startup from the deployment mode and shared
//! read-only by every request handler and the WebSocket endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};

use super::federated::{FederatedAuthProvider, IdentityVerifier, VerifiedIdentity};
use super::jwt::{AccessClaims, TokenCodec};
use super::local::LocalAuthProvider;
use super::principal::{Principal, PrincipalStore};
use crate::error::ApiResult;

/// Result of validating a raw token, before any principal lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedToken {
    /// Locally issued access token
    Local(AccessClaims),
    /// Identity confirmed by the external issuer
    Federated(VerifiedIdentity),
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Resolve the caller from the request headers.
    ///
    /// Fails with `Unauthenticated` when no valid bearer credential is present
    /// and with `AccountInactive` when the resolved principal is deactivated.
    async fn get_current_user(&self, headers: &HeaderMap) -> ApiResult<Principal>;

    /// Validate a raw token without touching the principal store
    async fn validate_token(&self, token: &str) -> Option<ValidatedToken>;
}

/// Extract the token from `Authorization: Bearer <token>`
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Which identity source backs the provider
pub enum ProviderKind {
    Local(TokenCodec),
    Federated(Arc<dyn IdentityVerifier>),
}

/// Build the provider for the configured mode
pub fn build_provider(
    kind: ProviderKind,
    principals: Arc<dyn PrincipalStore>,
) -> Arc<dyn AuthProvider> {
    match kind {
        ProviderKind::Local(codec) => {
            tracing::info!("Using local token authentication");
            Arc::new(LocalAuthProvider::new(codec, principals))
        }
        ProviderKind::Federated(verifier) => {
            tracing::info!("Using federated identity authentication");
            Arc::new(FederatedAuthProvider::new(verifier, principals))
        }
    }
}
