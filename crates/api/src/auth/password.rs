//! Password and PIN hashing (Argon2id, PHC strings)

use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use std::sync::{Arc, OnceLock};

/// Error raised when a hash cannot be produced
#[derive(Debug, thiserror::Error)]
#[error("credential hashing failed: {0}")]
pub struct HashError(String);

/// Salted, adaptive hasher with a tunable work factor.
///
/// The output is a self-describing PHC string, so hashes produced with older
/// parameters keep verifying after the work factor is raised.
#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
    /// Hash checked against when the account is unknown, built on first use
    decoy: Arc<OnceLock<String>>,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
            decoy: Arc::default(),
        }
    }
}

impl CredentialHasher {
    /// `memory_kib`, `iterations` and `parallelism` map to Argon2's m, t and p.
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, HashError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| HashError(e.to_string()))?;
        Ok(Self {
            params,
            decoy: Arc::default(),
        })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, secret: &str) -> Result<String, HashError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| HashError(e.to_string()))
    }

    /// False on mismatch and on any malformed hash
    pub fn verify(&self, secret: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        self.argon2()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok()
    }

    /// Verification for an account that does not exist. Always false, but
    /// costs the same as a real `verify` so response timing does not reveal
    /// which accounts exist.
    pub fn verify_absent(&self, secret: &str) -> bool {
        let decoy = self
            .decoy
            .get_or_init(|| self.hash(DECOY_SECRET).unwrap_or_default());
        let _ = self.verify(secret, decoy);
        false
    }
}

const DECOY_SECRET: &str = "decoy credential for unknown accounts";

/// Hash of 32 random bytes nobody knows.
///
/// Stored as the password of federated principals so password login can
/// never succeed for them.
pub fn generate_impossible_hash() -> Result<String, HashError> {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    CredentialHasher::default().hash(&hex::encode(bytes))
}
