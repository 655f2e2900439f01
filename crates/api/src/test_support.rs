//! In-memory stores and state builders shared by unit tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chorequest_billing::{
    BillingResult, FamilyBilling, FamilyDirectory, NoopBillingProvider, SubscriptionGate,
    SubscriptionStatus,
};
use chorequest_shared::RateLimiter;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::auth::federated::{IdentityVerifier, VerifiedIdentity, VerifyError};
use crate::auth::jwt::TokenCodec;
use crate::auth::password::CredentialHasher;
use crate::auth::principal::{NewPrincipal, Principal, PrincipalStore, Role, StoredCredentials};
use crate::auth::provider::{build_provider, ProviderKind};
use crate::auth::refresh::{RefreshTokenService, RefreshTokenStore};
use crate::config::Config;
use crate::state::AppState;

pub const TEST_SECRET: &str = "test-signing-secret-0123456789";

/// Argon2 parameters cheap enough for unit tests
pub fn fast_hasher() -> CredentialHasher {
    CredentialHasher::new(8, 1, 1).unwrap()
}

struct StoredPrincipal {
    principal: Principal,
    credentials: StoredCredentials,
}

#[derive(Default)]
pub struct MemoryPrincipalStore {
    rows: Mutex<HashMap<Uuid, StoredPrincipal>>,
}

impl MemoryPrincipalStore {
    pub fn insert(&self, username: &str, role: Role, active: bool) -> Principal {
        self.insert_with_credentials(username, role, active, "!unusable", None)
    }

    pub fn insert_with_credentials(
        &self,
        username: &str,
        role: Role,
        active: bool,
        password_hash: &str,
        pin_hash: Option<&str>,
    ) -> Principal {
        let principal = Principal {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: username.to_string(),
            role,
            is_active: active,
            external_id: None,
        };
        self.rows.lock().unwrap().insert(
            principal.id,
            StoredPrincipal {
                principal: principal.clone(),
                credentials: StoredCredentials {
                    password_hash: password_hash.to_string(),
                    pin_hash: pin_hash.map(String::from),
                },
            },
        );
        principal
    }

    pub fn set_active(&self, id: Uuid, active: bool) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.principal.is_active = active;
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn find(&self, pred: impl Fn(&Principal) -> bool) -> Option<Principal> {
        self.rows
            .lock()
            .unwrap()
            .values()
            .map(|row| &row.principal)
            .find(|p| pred(p))
            .cloned()
    }
}

#[async_trait]
impl PrincipalStore for MemoryPrincipalStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, sqlx::Error> {
        Ok(self.find(|p| p.id == id))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Principal>, sqlx::Error> {
        Ok(self.find(|p| p.username == username))
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Principal>, sqlx::Error> {
        Ok(self.find(|p| p.external_id.as_deref() == Some(external_id)))
    }

    async fn credentials(&self, id: Uuid) -> Result<Option<StoredCredentials>, sqlx::Error> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&id)
            .map(|row| row.credentials.clone()))
    }

    async fn create(&self, new: NewPrincipal) -> Result<Option<Principal>, sqlx::Error> {
        let mut rows = self.rows.lock().unwrap();
        let taken = rows.values().any(|row| {
            row.principal.username == new.username
                || (new.external_id.is_some() && row.principal.external_id == new.external_id)
        });
        if taken {
            return Ok(None);
        }

        let principal = Principal {
            id: Uuid::new_v4(),
            username: new.username,
            display_name: new.display_name,
            role: new.role,
            is_active: true,
            external_id: new.external_id,
        };
        rows.insert(
            principal.id,
            StoredPrincipal {
                principal: principal.clone(),
                credentials: StoredCredentials {
                    password_hash: new.password_hash,
                    pin_hash: None,
                },
            },
        );
        Ok(Some(principal))
    }

    async fn link_external(
        &self,
        id: Uuid,
        external_id: &str,
        display_name: &str,
    ) -> Result<Option<Principal>, sqlx::Error> {
        let mut rows = self.rows.lock().unwrap();
        Ok(rows
            .get_mut(&id)
            .filter(|row| row.principal.external_id.is_none())
            .map(|row| {
                row.principal.external_id = Some(external_id.to_string());
                row.principal.display_name = display_name.to_string();
                row.principal.clone()
            }))
    }
}

#[derive(Default)]
pub struct MemoryRefreshStore {
    rows: Mutex<HashMap<String, (Uuid, OffsetDateTime)>>,
}

impl MemoryRefreshStore {
    pub fn contains(&self, token_hash: &str) -> bool {
        self.rows.lock().unwrap().contains_key(token_hash)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshStore {
    async fn insert(
        &self,
        token_hash: &str,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        self.rows
            .lock()
            .unwrap()
            .entry(token_hash.to_string())
            .or_insert((user_id, expires_at));
        Ok(())
    }

    async fn find_valid(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(token_hash)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(user_id, _)| *user_id))
    }

    async fn delete(&self, token_hash: &str) -> Result<bool, sqlx::Error> {
        Ok(self.rows.lock().unwrap().remove(token_hash).is_some())
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> Result<u64, sqlx::Error> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, (_, expires_at)| *expires_at >= now);
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryFamilyDirectory {
    /// family id -> (billing state, child count)
    families: Mutex<HashMap<Uuid, (FamilyBilling, i64)>>,
    members: Mutex<HashMap<Uuid, Uuid>>,
}

impl MemoryFamilyDirectory {
    /// Add a family with the given state and make `member` part of it
    pub fn add(
        &self,
        member: Uuid,
        status: SubscriptionStatus,
        trial_ends_at: Option<OffsetDateTime>,
        child_count: i64,
    ) -> FamilyBilling {
        let family = FamilyBilling {
            id: Uuid::new_v4(),
            status,
            trial_ends_at,
            current_period_end: None,
        };
        self.families
            .lock()
            .unwrap()
            .insert(family.id, (family.clone(), child_count));
        self.members.lock().unwrap().insert(member, family.id);
        family
    }

    pub fn set_status(&self, family_id: Uuid, status: SubscriptionStatus) {
        if let Some((family, _)) = self.families.lock().unwrap().get_mut(&family_id) {
            family.status = status;
        }
    }
}

#[async_trait]
impl FamilyDirectory for MemoryFamilyDirectory {
    async fn family_for_user(&self, user_id: Uuid) -> BillingResult<Option<FamilyBilling>> {
        let Some(family_id) = self.members.lock().unwrap().get(&user_id).copied() else {
            return Ok(None);
        };
        Ok(self
            .families
            .lock()
            .unwrap()
            .get(&family_id)
            .map(|(family, _)| family.clone()))
    }

    async fn child_count(&self, family_id: Uuid) -> BillingResult<i64> {
        Ok(self
            .families
            .lock()
            .unwrap()
            .get(&family_id)
            .map(|(_, count)| *count)
            .unwrap_or(0))
    }

    async fn create_family(
        &self,
        _name: &str,
        owner_id: Uuid,
        trial_ends_at: OffsetDateTime,
    ) -> BillingResult<FamilyBilling> {
        Ok(self.add(owner_id, SubscriptionStatus::None, Some(trial_ends_at), 0))
    }
}

/// Verifier backed by a fixed token table
#[derive(Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, VerifiedIdentity>,
}

impl StaticVerifier {
    pub fn with(token: &str, identity: VerifiedIdentity) -> Self {
        Self::default().and(token, identity)
    }

    pub fn and(mut self, token: &str, identity: VerifiedIdentity) -> Self {
        self.tokens.insert(token.to_string(), identity);
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError> {
        self.tokens.get(token).cloned().ok_or(VerifyError::Invalid)
    }
}

pub fn local_config(extra: &[(&str, &str)]) -> Config {
    config_from(&[("APP_MODE", "local")], extra)
}

pub fn federated_config(extra: &[(&str, &str)]) -> Config {
    config_from(
        &[
            ("APP_MODE", "federated"),
            ("FIREBASE_PROJECT_ID", "chorequest-test"),
            ("FIREBASE_WEB_API_KEY", "public-web-key"),
            ("STRIPE_SECRET_KEY", "sk_test_123"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_test"),
            ("STRIPE_PRICE_ID", "price_123"),
        ],
        extra,
    )
}

fn config_from(base: &[(&str, &str)], extra: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("SECRET_KEY".to_string(), TEST_SECRET.to_string()),
        (
            "DATABASE_URL".to_string(),
            "postgres://localhost/chorequest_test".to_string(),
        ),
    ]);
    for (key, value) in base.iter().chain(extra) {
        vars.insert(key.to_string(), value.to_string());
    }
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

/// Handles onto the in-memory stores behind a test [`AppState`]
pub struct TestApp {
    pub state: AppState,
    pub principals: Arc<MemoryPrincipalStore>,
    pub refresh_store: Arc<MemoryRefreshStore>,
    pub families: Arc<MemoryFamilyDirectory>,
}

impl TestApp {
    pub fn codec(&self) -> TokenCodec {
        TokenCodec::new(TEST_SECRET)
    }

    pub fn access_token(&self, principal: &Principal) -> String {
        self.codec()
            .issue_access(principal.id, principal.role, Duration::minutes(5))
    }
}

/// Local-mode state over in-memory stores
pub fn local_app(config: Config) -> TestApp {
    let principals = Arc::new(MemoryPrincipalStore::default());
    let provider = build_provider(
        ProviderKind::Local(TokenCodec::new(TEST_SECRET)),
        principals.clone(),
    );
    assemble(config, principals, provider)
}

/// Federated-mode state using the given verifier
pub fn federated_app(config: Config, verifier: StaticVerifier) -> TestApp {
    let principals = Arc::new(MemoryPrincipalStore::default());
    let provider = build_provider(ProviderKind::Federated(Arc::new(verifier)), principals.clone());
    assemble(config, principals, provider)
}

fn assemble(
    config: Config,
    principals: Arc<MemoryPrincipalStore>,
    auth: Arc<dyn crate::auth::AuthProvider>,
) -> TestApp {
    let refresh_store = Arc::new(MemoryRefreshStore::default());
    let families = Arc::new(MemoryFamilyDirectory::default());
    let refresh = RefreshTokenService::new(
        TokenCodec::new(TEST_SECRET),
        refresh_store.clone(),
        principals.clone(),
        Duration::minutes(config.access_token_expire_minutes),
        Duration::days(config.refresh_token_expire_days),
    );
    let gate = SubscriptionGate::new(config.is_federated(), config.free_child_limit);

    let state = AppState {
        config: Arc::new(config),
        auth,
        principals: principals.clone(),
        refresh,
        families: families.clone(),
        billing: Arc::new(NoopBillingProvider),
        gate,
        rate_limiter: RateLimiter::new_in_memory(),
        hasher: fast_hasher(),
    };

    TestApp {
        state,
        principals,
        refresh_store,
        families,
    }
}

/// Send one request through the router and decode a JSON body if present
pub async fn send(
    router: axum::Router,
    method: axum::http::Method,
    path: &str,
    body: Option<serde_json::Value>,
    headers: &[(&str, &str)],
) -> (axum::http::StatusCode, axum::http::HeaderMap, serde_json::Value) {
    use tower::ServiceExt;

    let mut builder = axum::http::Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };

    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, headers, json)
}
