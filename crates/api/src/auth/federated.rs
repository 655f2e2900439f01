//! Hosted provider: Firebase ID tokens
//!
//! Tokens are verified against the Identity Toolkit `accounts:lookup`
//! endpoint, which also rejects revoked tokens and disabled accounts. Verified
//! identities are cached for a short time and concurrent verifications of the
//! same token share one upstream call, so a dashboard firing parallel
//! requests costs a single lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use super::password;
use super::principal::{NewPrincipal, Principal, PrincipalStore, Role};
use super::provider::{extract_bearer_token, AuthProvider, ValidatedToken};
use crate::error::{ApiError, ApiResult};

/// Verified identities are reused for this long
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

/// Upper bound on cached identities; the oldest entry is evicted first
const MAX_CACHE_ENTRIES: usize = 10_000;

/// Identity confirmed by the external issuer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Issuer-assigned subject id
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl VerifiedIdentity {
    /// Username a principal provisioned for this identity gets
    pub fn username(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.uid)
    }

    pub fn preferred_display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty() && Some(*name) != self.email.as_deref())
            .or(self.email.as_deref())
            .unwrap_or(&self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("identity token rejected")]
    Invalid,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// External identity verifier
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    email: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Clone)]
struct CachedIdentity {
    identity: VerifiedIdentity,
    cached_at: Instant,
}

type InFlightResult = Option<VerifiedIdentity>;

#[derive(Default)]
struct VerificationState {
    cache: HashMap<String, CachedIdentity>,
    in_flight: HashMap<String, broadcast::Sender<InFlightResult>>,
}

type SharedState = Arc<Mutex<VerificationState>>;

enum Slot {
    Cached(VerifiedIdentity),
    Follower(broadcast::Receiver<InFlightResult>),
    Leader(LeaderGuard),
}

/// Held by the task doing the upstream call. Dropping it without
/// [`finish`](LeaderGuard::finish) releases waiting followers with an error.
struct LeaderGuard {
    state: SharedState,
    key: String,
    finished: bool,
}

impl LeaderGuard {
    fn finish(mut self, result: &Result<VerifiedIdentity, VerifyError>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Ok(identity) = result {
            if state.cache.len() >= MAX_CACHE_ENTRIES {
                if let Some(oldest) = state
                    .cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.cached_at)
                    .map(|(key, _)| key.clone())
                {
                    state.cache.remove(&oldest);
                    tracing::debug!("Evicted oldest cached identity to stay under limit");
                }
            }
            state.cache.insert(
                self.key.clone(),
                CachedIdentity {
                    identity: identity.clone(),
                    cached_at: Instant::now(),
                },
            );
        }

        if let Some(tx) = state.in_flight.remove(&self.key) {
            // Receivers may have gone away
            let _ = tx.send(result.as_ref().ok().cloned());
        }
        self.finished = true;
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.in_flight.remove(&self.key);
        }
    }
}

/// Firebase verifier with caching and request coalescing
#[derive(Clone)]
pub struct FirebaseIdentityVerifier {
    http: Client,
    lookup_url: String,
    api_key: String,
    state: SharedState,
}

impl FirebaseIdentityVerifier {
    pub fn new(http: Client, identity_toolkit_url: &str, api_key: &str) -> Self {
        Self {
            http,
            lookup_url: format!(
                "{}/v1/accounts:lookup",
                identity_toolkit_url.trim_end_matches('/')
            ),
            api_key: api_key.to_string(),
            state: SharedState::default(),
        }
    }

    /// Number of identities currently cached
    pub fn cached_entries(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cache
            .len()
    }

    fn claim_slot(&self, key: &str) -> Slot {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(cached) = state.cache.get(key) {
            if cached.cached_at.elapsed() < TOKEN_CACHE_TTL {
                return Slot::Cached(cached.identity.clone());
            }
            state.cache.remove(key);
        }

        if let Some(tx) = state.in_flight.get(key) {
            tracing::debug!("Joining in-flight identity verification");
            return Slot::Follower(tx.subscribe());
        }

        let (tx, _) = broadcast::channel(1);
        state.in_flight.insert(key.to_string(), tx);
        Slot::Leader(LeaderGuard {
            state: self.state.clone(),
            key: key.to_string(),
            finished: false,
        })
    }

    async fn lookup(&self, token: &str) -> Result<VerifiedIdentity, VerifyError> {
        let response = self
            .http
            .post(&self.lookup_url)
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({ "idToken": token }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Identity lookup request failed");
                VerifyError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if status.is_client_error() {
            tracing::debug!(status = %status, "Identity token rejected by issuer");
            return Err(VerifyError::Invalid);
        }
        if !status.is_success() {
            tracing::warn!(status = %status, "Identity lookup failed");
            return Err(VerifyError::Unavailable(status.to_string()));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

        let user = body.users.into_iter().next().ok_or(VerifyError::Invalid)?;
        if user.disabled {
            tracing::info!(uid = %user.local_id, "Identity belongs to a disabled account");
            return Err(VerifyError::Invalid);
        }

        Ok(VerifiedIdentity {
            uid: user.local_id,
            email: user.email,
            display_name: user.display_name,
        })
    }
}

#[async_trait]
impl IdentityVerifier for FirebaseIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError> {
        let key = hex::encode(Sha256::digest(token.as_bytes()));

        match self.claim_slot(&key) {
            Slot::Cached(identity) => Ok(identity),
            Slot::Follower(mut rx) => match rx.recv().await {
                Ok(Some(identity)) => Ok(identity),
                Ok(None) | Err(_) => Err(VerifyError::Invalid),
            },
            Slot::Leader(guard) => {
                let result = self.lookup(token).await;
                guard.finish(&result);
                result
            }
        }
    }
}

pub struct FederatedAuthProvider {
    verifier: Arc<dyn IdentityVerifier>,
    principals: Arc<dyn PrincipalStore>,
}

impl FederatedAuthProvider {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, principals: Arc<dyn PrincipalStore>) -> Self {
        Self {
            verifier,
            principals,
        }
    }

    /// Find, re-link or provision the principal for a verified identity
    async fn resolve(&self, identity: &VerifiedIdentity) -> ApiResult<Principal> {
        if let Some(principal) = self.principals.find_by_external_id(&identity.uid).await? {
            return Ok(principal);
        }

        let display_name = identity.preferred_display_name();

        if let Some(existing) = self.principals.find_by_username(identity.username()).await? {
            if existing.external_id.is_some() {
                tracing::warn!(
                    user_id = %existing.id,
                    "Username belongs to a principal linked to another identity"
                );
                return Err(username_taken());
            }
            if let Some(relinked) = self
                .principals
                .link_external(existing.id, &identity.uid, display_name)
                .await?
            {
                tracing::info!(user_id = %relinked.id, "Re-linked existing user to external identity");
                return Ok(relinked);
            }
            // Linked concurrently; only acceptable if it was this identity
            return self
                .principals
                .find_by_external_id(&identity.uid)
                .await?
                .ok_or_else(username_taken);
        }

        let password_hash =
            password::generate_impossible_hash().map_err(|e| ApiError::Internal(e.to_string()))?;

        let created = self
            .principals
            .create(NewPrincipal {
                username: identity.username().to_string(),
                display_name: display_name.to_string(),
                password_hash,
                role: Role::Admin,
                external_id: Some(identity.uid.clone()),
            })
            .await?;

        if let Some(principal) = created {
            tracing::info!(user_id = %principal.id, "Provisioned user for external identity");
            return Ok(principal);
        }

        // Lost a race with a concurrent request for the same identity
        if let Some(principal) = self.principals.find_by_external_id(&identity.uid).await? {
            return Ok(principal);
        }
        Err(username_taken())
    }
}

fn username_taken() -> ApiError {
    ApiError::Conflict("Username is already taken by another account".to_string())
}

#[async_trait]
impl AuthProvider for FederatedAuthProvider {
    async fn get_current_user(&self, headers: &HeaderMap) -> ApiResult<Principal> {
        let token = extract_bearer_token(headers).ok_or(ApiError::Unauthenticated)?;

        let identity = self.verifier.verify(token).await.map_err(|err| {
            tracing::debug!(error = %err, "Identity token rejected");
            ApiError::Unauthenticated
        })?;

        let principal = self.resolve(&identity).await?;
        if !principal.is_active {
            tracing::warn!(user_id = %principal.id, "Inactive account presented a valid identity");
            return Err(ApiError::AccountInactive);
        }

        Ok(principal)
    }

    async fn validate_token(&self, token: &str) -> Option<ValidatedToken> {
        self.verifier
            .verify(token)
            .await
            .ok()
            .map(ValidatedToken::Federated)
    }
}
