//! Configuration for the API server
//!
//! Everything is read from the environment once at startup. Validation runs
//! before the server binds, so a weak signing secret or a half-configured
//! hosted deployment never serves a request.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chorequest_billing::{StripeConfig, DEFAULT_STRIPE_API_URL};

/// Minimum accepted length of `SECRET_KEY`
pub const MIN_SECRET_LENGTH: usize = 16;

/// Secrets that are rejected regardless of length (compared case-insensitively)
pub const WEAK_SECRETS: &[&str] = &[
    "changeme",
    "secret",
    "password",
    "12345678",
    "1234567890123456",
];

pub const ACCESS_TOKEN_MINUTES_RANGE: RangeInclusive<i64> = 1..=1440;
pub const REFRESH_TOKEN_DAYS_RANGE: RangeInclusive<i64> = 1..=365;
pub const TRIAL_DAYS_RANGE: RangeInclusive<i64> = 0..=365;
pub const FREE_CHILD_LIMIT_RANGE: RangeInclusive<i64> = 0..=1000;
const RATE_LIMIT_MAX_RANGE: RangeInclusive<usize> = 1..=10_000;
const RATE_LIMIT_WINDOW_RANGE: RangeInclusive<u64> = 1..=86_400;

pub const DEFAULT_IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com";

/// Deployment mode, chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// Self-hosted: locally issued tokens, billing disabled
    Local,
    /// Hosted: Firebase identities, Stripe subscriptions
    Federated,
}

impl AppMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppMode::Local => "local",
            AppMode::Federated => "federated",
        }
    }
}

impl FromStr for AppMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "selfhosted" => Ok(AppMode::Local),
            "federated" | "saas" => Ok(AppMode::Federated),
            _ => Err(ConfigError::Invalid("APP_MODE")),
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token signing secret. Never printed.
#[derive(Clone)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

/// Firebase settings for the hosted deployment
#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    pub project_id: String,
    /// Public web API key, also handed to the browser
    pub web_api_key: String,
    pub identity_toolkit_url: String,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub app_mode: AppMode,
    pub secret_key: SecretKey,
    pub database_url: String,
    pub bind_address: String,

    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_days: i64,

    pub login_rate_limit_max: usize,
    pub pin_rate_limit_max: usize,
    pub register_rate_limit_max: usize,
    pub rate_limit_window_seconds: u64,

    pub registration_enabled: bool,
    pub free_child_limit: i64,
    pub trial_days: i64,

    pub cors_origins: Vec<String>,
    /// Adds HSTS to every response when the app is served over TLS
    pub cookie_secure: bool,
    /// Take the client address from forwarding headers instead of the
    /// socket peer. Only safe behind a proxy that overwrites them.
    pub trust_proxy_headers: bool,

    /// Present only in federated mode
    pub firebase: Option<FirebaseConfig>,
    /// Present only in federated mode
    pub stripe: Option<StripeConfig>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build and validate configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let app_mode = match get("APP_MODE") {
            Some(value) => value.parse()?,
            None => AppMode::Local,
        };

        let secret_key = get("SECRET_KEY").ok_or(ConfigError::Missing("SECRET_KEY"))?;
        validate_secret(&secret_key)?;

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let bind_address = get("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8000".to_string());

        let (firebase, stripe) = match app_mode {
            AppMode::Local => (None, None),
            AppMode::Federated => {
                let require = |key: &'static str| {
                    get(key).ok_or(ConfigError::RequiredInFederatedMode(key))
                };

                let firebase = FirebaseConfig {
                    project_id: require("FIREBASE_PROJECT_ID")?,
                    web_api_key: require("FIREBASE_WEB_API_KEY")?,
                    identity_toolkit_url: get("IDENTITY_TOOLKIT_URL")
                        .unwrap_or_else(|| DEFAULT_IDENTITY_TOOLKIT_URL.to_string()),
                };
                let stripe = StripeConfig {
                    secret_key: require("STRIPE_SECRET_KEY")?,
                    webhook_secret: require("STRIPE_WEBHOOK_SECRET")?,
                    price_id: require("STRIPE_PRICE_ID")?,
                    api_url: get("STRIPE_API_URL")
                        .unwrap_or_else(|| DEFAULT_STRIPE_API_URL.to_string()),
                };
                (Some(firebase), Some(stripe))
            }
        };

        let cors_origins = get("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            app_mode,
            secret_key: SecretKey::new(secret_key),
            database_url,
            bind_address,
            access_token_expire_minutes: parse_in_range(
                &get,
                "ACCESS_TOKEN_EXPIRE_MINUTES",
                15,
                ACCESS_TOKEN_MINUTES_RANGE,
            )?,
            refresh_token_expire_days: parse_in_range(
                &get,
                "REFRESH_TOKEN_EXPIRE_DAYS",
                30,
                REFRESH_TOKEN_DAYS_RANGE,
            )?,
            login_rate_limit_max: parse_in_range(&get, "LOGIN_RATE_LIMIT_MAX", 10, RATE_LIMIT_MAX_RANGE)?,
            pin_rate_limit_max: parse_in_range(&get, "PIN_RATE_LIMIT_MAX", 5, RATE_LIMIT_MAX_RANGE)?,
            register_rate_limit_max: parse_in_range(
                &get,
                "REGISTER_RATE_LIMIT_MAX",
                5,
                RATE_LIMIT_MAX_RANGE,
            )?,
            rate_limit_window_seconds: parse_in_range(
                &get,
                "RATE_LIMIT_WINDOW_SECONDS",
                60,
                RATE_LIMIT_WINDOW_RANGE,
            )?,
            registration_enabled: parse_bool_or(&get, "REGISTRATION_ENABLED", false)?,
            free_child_limit: parse_in_range(&get, "FREE_CHILD_LIMIT", 0, FREE_CHILD_LIMIT_RANGE)?,
            trial_days: parse_in_range(&get, "TRIAL_DAYS", 7, TRIAL_DAYS_RANGE)?,
            cors_origins,
            cookie_secure: parse_bool_or(&get, "COOKIE_SECURE", false)?,
            trust_proxy_headers: parse_bool_or(&get, "TRUST_PROXY_HEADERS", false)?,
            firebase,
            stripe,
        })
    }

    pub fn is_federated(&self) -> bool {
        self.app_mode == AppMode::Federated
    }
}

/// Reject short or well-known signing secrets.
pub fn validate_secret(secret: &str) -> Result<(), ConfigError> {
    if secret.chars().count() < MIN_SECRET_LENGTH {
        return Err(ConfigError::SecretTooShort);
    }
    let lowered = secret.to_lowercase();
    if WEAK_SECRETS.iter().any(|weak| *weak == lowered) {
        return Err(ConfigError::WeakSecret);
    }
    Ok(())
}

/// Parse `key`, falling back to `default`, and reject values outside `range`.
///
/// Token lifetimes are bounded here so that expiry arithmetic on the request
/// path cannot overflow.
fn parse_in_range<T, G>(
    get: &G,
    key: &'static str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd,
    G: Fn(&str) -> Option<String>,
{
    let value = match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key))?,
        None => default,
    };
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange(key))
    }
}

fn parse_bool_or<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(key)),
        },
        None => Ok(default),
    }
}

/// Configuration error. Each message fits on a single line.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Value out of range for environment variable: {0}")]
    OutOfRange(&'static str),

    #[error("SECRET_KEY must be at least 16 characters")]
    SecretTooShort,

    #[error("SECRET_KEY is a known weak value. Choose a strong secret.")]
    WeakSecret,

    #[error("{0} is required in federated mode")]
    RequiredInFederatedMode(&'static str),
}
