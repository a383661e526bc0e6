//! Token issuance/verification and credential hashing
//!
//! Tokens are opaque to the rest of the core: the socket layer and the REST
//! middleware hand a raw token to [`TokenService::verify`] and get a user id
//! back. Passcodes and passwords share the same salted-digest scheme.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// A resolved identity, attached to a socket or REST request after token
/// verification
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: Uuid,
    pub username: String,
}

/// JWT claims for session authentication
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    pub iat: usize,
}

/// Issues and verifies signed tokens
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl TokenService {
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            lifetime,
        }
    }

    /// Mint a token for a user
    pub fn issue(&self, user_id: Uuid) -> Result<String> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + self.lifetime.as_secs() as usize,
            iat: now,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Verify a token and return the user id it was minted for
    pub fn verify(&self, token: &str) -> Result<Uuid> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))?;
        Uuid::parse_str(&data.claims.sub)
            .map_err(|_| ChatError::unauthorized("malformed token subject"))
    }
}

/// Hash a secret with a fresh random salt. Format: `base64(salt):base64(digest)`.
pub fn hash_secret(secret: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = salted_digest(&salt, secret);
    format!("{}:{}", BASE64.encode(salt), BASE64.encode(digest))
}

/// Check a secret against a stored `salt:digest` hash
pub fn verify_secret(secret: &str, stored: &str) -> bool {
    let Some((salt_b64, digest_b64)) = stored.split_once(':') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (BASE64.decode(salt_b64), BASE64.decode(digest_b64)) else {
        return false;
    };
    let actual = salted_digest(&salt, secret);
    // Constant-time compare; digests are fixed-length.
    if actual.len() != expected.len() {
        return false;
    }
    actual
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn salted_digest(salt: &[u8], secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_secret("hunter2");
        assert!(verify_secret("hunter2", &hash));
        assert!(!verify_secret("hunter3", &hash));
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_secret("same"), hash_secret("same"));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(!verify_secret("x", "not-a-hash"));
        assert!(!verify_secret("x", "!!!:???"));
    }

    #[test]
    fn test_token_round_trip() {
        let service = TokenService::new("test-secret", Duration::from_secs(3600));
        let user_id = Uuid::new_v4();
        let token = service.issue(user_id).unwrap();
        assert_eq!(service.verify(&token).unwrap(), user_id);
    }

    #[test]
    fn test_token_wrong_secret_rejected() {
        let a = TokenService::new("secret-a", Duration::from_secs(3600));
        let b = TokenService::new("secret-b", Duration::from_secs(3600));
        let token = a.issue(Uuid::new_v4()).unwrap();
        assert!(b.verify(&token).is_err());
    }
}
