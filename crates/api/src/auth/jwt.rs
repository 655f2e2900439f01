//! Compact HS256 session tokens
//!
//! `base64url(header) "." base64url(claims) "." base64url(signature)` where the
//! signature is HMAC-SHA256 over the first two segments. Padding is stripped
//! when encoding and tolerated when decoding. The wire format is plain JWT, so
//! any standard HS256 decoder can read these tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::principal::Role;

type HmacSha256 = Hmac<Sha256>;

/// Fixed header, serialized once
const HEADER_JSON: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Claims of a short-lived access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: i64,
}

/// Claims of a long-lived refresh token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub exp: i64,
    /// Random per token, so each session stores its own credential row
    pub jti: Uuid,
}

/// Token claims, discriminated by the `type` claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Claims {
    Access(AccessClaims),
    Refresh(RefreshClaims),
}

impl Claims {
    pub fn expires_at(&self) -> i64 {
        match self {
            Claims::Access(claims) => claims.exp,
            Claims::Refresh(claims) => claims.exp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("token has the wrong type")]
    WrongType,
}

/// Stateless encoder/decoder bound to the signing secret
#[derive(Clone)]
pub struct TokenCodec {
    mac: HmacSha256,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCodec")
    }
}

impl TokenCodec {
    pub fn new(secret: &str) -> Self {
        #[allow(clippy::expect_used)] // HMAC accepts keys of any length
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC-SHA256 accepts keys of any length");
        Self { mac }
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }

    /// Encode claims. Identical inputs give identical tokens.
    pub fn encode(&self, claims: &Claims) -> String {
        let header_b64 = URL_SAFE_NO_PAD.encode(HEADER_JSON);
        // Serializing plain structs of integers and strings cannot fail
        let claims_json = serde_json::to_vec(claims).unwrap_or_default();
        let claims_b64 = URL_SAFE_NO_PAD.encode(claims_json);

        let signing_input = format!("{}.{}", header_b64, claims_b64);
        let mut mac = self.mac();
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        format!("{}.{}", signing_input, signature)
    }

    pub fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        self.decode_at(token, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Decode against an explicit clock reading (epoch seconds)
    pub fn decode_at(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let mut segments = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Malformed);
        };

        let signature = b64_decode(signature_b64)?;
        let mut mac = self.mac();
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: Claims =
            serde_json::from_slice(&b64_decode(claims_b64)?).map_err(|_| TokenError::Malformed)?;

        if claims.expires_at() <= now {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    pub fn decode_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        match self.decode(token)? {
            Claims::Access(claims) => Ok(claims),
            Claims::Refresh(_) => Err(TokenError::WrongType),
        }
    }

    pub fn decode_refresh(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        match self.decode(token)? {
            Claims::Refresh(claims) => Ok(claims),
            Claims::Access(_) => Err(TokenError::WrongType),
        }
    }

    /// Mint an access token expiring `ttl` from now
    pub fn issue_access(&self, user_id: Uuid, role: Role, ttl: Duration) -> String {
        self.encode(&Claims::Access(AccessClaims {
            sub: user_id,
            role,
            exp: (OffsetDateTime::now_utc() + ttl).unix_timestamp(),
        }))
    }

    /// Mint a refresh token expiring `ttl` from now
    pub fn issue_refresh(&self, user_id: Uuid, ttl: Duration) -> (String, OffsetDateTime) {
        let expires_at = OffsetDateTime::now_utc() + ttl;
        let token = self.encode(&Claims::Refresh(RefreshClaims {
            sub: user_id,
            exp: expires_at.unix_timestamp(),
            jti: Uuid::new_v4(),
        }));
        (token, expires_at)
    }
}

fn b64_decode(segment: &str) -> Result<Vec<u8>, TokenError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| TokenError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-signing-secret";

    fn codec() -> TokenCodec {
        TokenCodec::new(SECRET)
    }

    fn access(exp: i64) -> Claims {
        Claims::Access(AccessClaims {
            sub: Uuid::parse_str("0b6e3a57-2f4e-4f0a-9c41-1d2f3a4b5c6d").unwrap(),
            role: Role::Parent,
            exp,
        })
    }

    fn far_future() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp() + 3600
    }

    #[test]
    fn test_round_trip() {
        let claims = access(far_future());
        let token = codec().encode(&claims);
        assert_eq!(token.split('.').count(), 3);
        assert!(!token.contains('='));
        assert_eq!(codec().decode(&token).unwrap(), claims);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let claims = access(far_future());
        assert_eq!(codec().encode(&claims), codec().encode(&claims));
    }

    #[test]
    fn test_header_is_fixed() {
        let token = codec().encode(&access(far_future()));
        let header = token.split('.').next().unwrap();
        let decoded = URL_SAFE_NO_PAD.decode(header).unwrap();
        assert_eq!(decoded, HEADER_JSON.as_bytes());
    }

    #[test]
    fn test_tampering_any_segment_is_rejected() {
        let token = codec().encode(&access(far_future()));
        let parts: Vec<&str> = token.split('.').collect();

        let other_header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims::Access(AccessClaims {
                sub: Uuid::new_v4(),
                role: Role::Admin,
                exp: far_future(),
            }))
            .unwrap(),
        );
        let other_signature = URL_SAFE_NO_PAD.encode([0u8; 32]);

        for forged in [
            format!("{}.{}.{}", other_header, parts[1], parts[2]),
            format!("{}.{}.{}", parts[0], forged_claims, parts[2]),
            format!("{}.{}.{}", parts[0], parts[1], other_signature),
        ] {
            assert_eq!(codec().decode(&forged), Err(TokenError::BadSignature));
        }
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = codec().encode(&access(far_future()));
        let other = TokenCodec::new("another-secret-entirely");
        assert_eq!(other.decode(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_segment_count_enforced() {
        for token in ["", "a", "a.b", "a.b.c.d", "..."] {
            assert!(codec().decode(token).is_err(), "accepted {:?}", token);
        }
    }

    #[test]
    fn test_garbage_never_panics() {
        for token in ["!!!.@@@.###", "é.ü.ö", "a..b", "....."] {
            assert!(codec().decode(token).is_err());
        }
    }

    #[test]
    fn test_padding_tolerated() {
        let token = codec().encode(&access(far_future()));
        let padded: Vec<String> = token
            .split('.')
            .map(|segment| {
                let pad = (4 - segment.len() % 4) % 4;
                format!("{}{}", segment, "=".repeat(pad))
            })
            .collect();
        assert!(codec().decode(&padded.join(".")).is_ok());
    }

    #[test]
    fn test_expiry_boundary() {
        let now = 1_700_000_000;
        let token = codec().encode(&access(now));
        assert_eq!(codec().decode_at(&token, now), Err(TokenError::Expired));
        assert_eq!(codec().decode_at(&token, now + 1), Err(TokenError::Expired));
        assert!(codec().decode_at(&token, now - 1).is_ok());
    }

    #[test]
    fn test_type_confusion_rejected() {
        let user = Uuid::new_v4();
        let codec = codec();
        let access = codec.issue_access(user, Role::Kid, Duration::minutes(15));
        let (refresh, _) = codec.issue_refresh(user, Duration::days(30));

        assert_eq!(codec.decode_access(&refresh), Err(TokenError::WrongType));
        assert_eq!(codec.decode_refresh(&access), Err(TokenError::WrongType));
        assert_eq!(codec.decode_access(&access).unwrap().role, Role::Kid);
        assert_eq!(codec.decode_refresh(&refresh).unwrap().sub, user);
    }

    #[test]
    fn test_refresh_tokens_unique_within_one_second() {
        let user = Uuid::new_v4();
        let codec = codec();
        let (first, first_exp) = codec.issue_refresh(user, Duration::days(30));
        let (second, second_exp) = codec.issue_refresh(user, Duration::days(30));

        assert_eq!(first_exp.unix_timestamp(), second_exp.unix_timestamp());
        assert_ne!(first, second);
        assert_ne!(
            codec.decode_refresh(&first).unwrap().jti,
            codec.decode_refresh(&second).unwrap().jti
        );
    }

    #[test]
    fn test_unknown_and_missing_fields_rejected() {
        let codec = codec();
        let exp = far_future();
        let sign = |claims: serde_json::Value| {
            let header = URL_SAFE_NO_PAD.encode(HEADER_JSON);
            let body = URL_SAFE_NO_PAD.encode(claims.to_string());
            let mut mac = codec.mac();
            mac.update(format!("{}.{}", header, body).as_bytes());
            let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
            format!("{}.{}.{}", header, body, sig)
        };
        let sub = Uuid::new_v4().to_string();

        // refresh tokens carry no role
        let jti = Uuid::new_v4().to_string();
        let with_role = sign(serde_json::json!({"type": "refresh", "sub": sub, "exp": exp, "jti": jti, "role": "admin"}));
        assert_eq!(codec.decode(&with_role), Err(TokenError::Malformed));

        let no_jti = sign(serde_json::json!({"type": "refresh", "sub": sub, "exp": exp}));
        assert_eq!(codec.decode(&no_jti), Err(TokenError::Malformed));

        let refresh = sign(serde_json::json!({"type": "refresh", "sub": sub, "exp": exp, "jti": jti}));
        assert!(codec.decode_refresh(&refresh).is_ok());

        let no_role = sign(serde_json::json!({"type": "access", "sub": sub, "exp": exp}));
        assert_eq!(codec.decode(&no_role), Err(TokenError::Malformed));

        let no_type = sign(serde_json::json!({"sub": sub, "exp": exp}));
        assert_eq!(codec.decode(&no_type), Err(TokenError::Malformed));

        let bad_role = sign(serde_json::json!({"type": "access", "sub": sub, "exp": exp, "role": "root"}));
        assert_eq!(codec.decode(&bad_role), Err(TokenError::Malformed));
    }

    #[test]
    fn test_readable_by_standard_decoder() {
        use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

        let user = Uuid::new_v4();
        let token = codec().issue_access(user, Role::Admin, Duration::minutes(5));

        let data = decode::<serde_json::Value>(
            &token,
            &DecodingKey::from_secret(SECRET.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();

        assert_eq!(data.claims["sub"], user.to_string());
        assert_eq!(data.claims["role"], "admin");
        assert_eq!(data.claims["type"], "access");
    }

    #[test]
    fn test_reads_standard_encoder_output() {
        use jsonwebtoken::{encode, EncodingKey, Header};

        let claims = access(far_future());
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        assert_eq!(codec().decode(&token).unwrap(), claims);
    }
}
