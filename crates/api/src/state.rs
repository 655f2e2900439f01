//! Application state

use std::sync::Arc;

use chorequest_billing::{
    BillingProvider, FamilyDirectory, NoopBillingProvider, StripeBillingProvider, StripeClient,
    SubscriptionGate, SubscriptionService,
};
use chorequest_shared::RateLimiter;
use reqwest::Client;
use sqlx::PgPool;
use time::Duration;

use crate::auth::federated::FirebaseIdentityVerifier;
use crate::auth::jwt::TokenCodec;
use crate::auth::password::CredentialHasher;
use crate::auth::principal::{PgPrincipalStore, PrincipalStore};
use crate::auth::provider::{build_provider, AuthProvider, ProviderKind};
use crate::auth::refresh::{PgRefreshTokenStore, RefreshTokenService};
use crate::config::{AppMode, Config};

/// Shared application state.
///
/// Built once at startup and read-only afterwards. Collaborators sit behind
/// trait objects so the router can run against in-memory stores in tests.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Provider chosen from the deployment mode
    pub auth: Arc<dyn AuthProvider>,
    pub principals: Arc<dyn PrincipalStore>,
    pub refresh: RefreshTokenService,
    pub families: Arc<dyn FamilyDirectory>,
    pub billing: Arc<dyn BillingProvider>,
    pub gate: SubscriptionGate,
    /// Throttles login, PIN and registration attempts
    pub rate_limiter: RateLimiter,
    pub hasher: CredentialHasher,
}

impl AppState {
    pub fn new(config: Config, pool: PgPool) -> anyhow::Result<Self> {
        let codec = TokenCodec::new(config.secret_key.expose());
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        let principals: Arc<dyn PrincipalStore> = Arc::new(PgPrincipalStore::new(pool.clone()));

        let kind = match (&config.app_mode, &config.firebase) {
            (AppMode::Federated, Some(firebase)) => {
                ProviderKind::Federated(Arc::new(FirebaseIdentityVerifier::new(
                    http_client,
                    &firebase.identity_toolkit_url,
                    &firebase.web_api_key,
                )))
            }
            (AppMode::Federated, None) => {
                anyhow::bail!("federated mode requires Firebase settings")
            }
            (AppMode::Local, _) => ProviderKind::Local(codec.clone()),
        };
        let auth = build_provider(kind, principals.clone());

        let refresh = RefreshTokenService::new(
            codec,
            Arc::new(PgRefreshTokenStore::new(pool.clone())),
            principals.clone(),
            Duration::minutes(config.access_token_expire_minutes),
            Duration::days(config.refresh_token_expire_days),
        );

        let subscriptions = SubscriptionService::new(pool);
        let billing: Arc<dyn BillingProvider> = match &config.stripe {
            Some(stripe) if config.is_federated() => {
                tracing::info!("Stripe billing enabled");
                Arc::new(StripeBillingProvider::new(
                    StripeClient::new(stripe.clone())?,
                    subscriptions.clone(),
                ))
            }
            _ => Arc::new(NoopBillingProvider),
        };

        let gate = SubscriptionGate::new(config.is_federated(), config.free_child_limit);

        Ok(Self {
            config: Arc::new(config),
            auth,
            principals,
            refresh,
            families: Arc::new(subscriptions),
            billing,
            gate,
            rate_limiter: RateLimiter::new_in_memory(),
            hasher: CredentialHasher::default(),
        })
    }
}
