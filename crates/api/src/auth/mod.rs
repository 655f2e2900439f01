//! Authentication for ChoreQuest
//!
//! Token codec, credential hashing, the two authentication providers and the
//! refresh credential lifecycle.

pub mod federated;
pub mod jwt;
pub mod local;
pub mod middleware;
pub mod password;
pub mod principal;
pub mod provider;
pub mod refresh;

pub use federated::{
    FederatedAuthProvider, FirebaseIdentityVerifier, IdentityVerifier, VerifiedIdentity,
    VerifyError,
};
pub use jwt::{AccessClaims, Claims, RefreshClaims, TokenCodec, TokenError};
pub use local::LocalAuthProvider;
pub use middleware::{
    client_address, forwarded_address, require_admin, require_auth, require_kid,
    require_parent, require_subscription, AuthUser, ClientAddress, CurrentFamily,
};
pub use password::{generate_impossible_hash, CredentialHasher, HashError};
pub use principal::{PgPrincipalStore, Principal, PrincipalStore, Role};
pub use provider::{build_provider, extract_bearer_token, AuthProvider, ProviderKind, ValidatedToken};
pub use refresh::{
    hash_token, sweep_expired, PgRefreshTokenStore, RefreshTokenService, RefreshTokenStore,
};
