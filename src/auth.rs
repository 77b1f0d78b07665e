//! Session tokens and password hashing for the dashboard surface.
//!
//! Tokens are HS256 JWTs signed with the server SECRET_KEY, carrying the
//! user email as subject plus the role, issue and expiry timestamps.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::gateway::errors::GatewayError;
use crate::store::models::UserRole;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User email.
    pub sub: String,
    pub role: UserRole,
    pub iat: i64,
    pub exp: i64,
}

pub fn create_access_token(
    email: &str,
    role: UserRole,
    secret: &str,
    ttl: std::time::Duration,
) -> Result<String, GatewayError> {
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
    let claims = Claims {
        sub: email.to_string(),
        role,
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| GatewayError::internal(format!("encode token: {e}")))
}

/// Expired, malformed and wrongly signed tokens all collapse into the
/// generic authentication error.
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, GatewayError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|_| GatewayError::Unauthenticated)
}

pub fn hash_password(password: &str) -> Result<String, GatewayError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| GatewayError::internal(format!("hash password: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "payflow-test-secret-key-0123456789abcdef";

    #[test]
    fn token_round_trip() {
        let token = create_access_token(
            "dev@merchant.test",
            UserRole::Merchant,
            SECRET,
            std::time::Duration::from_secs(3600),
        )
        .unwrap();

        let claims = decode_token(&token, SECRET).unwrap();
        assert_eq!(claims.sub, "dev@merchant.test");
        assert_eq!(claims.role, UserRole::Merchant);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = create_access_token(
            "dev@merchant.test",
            UserRole::User,
            SECRET,
            std::time::Duration::from_secs(3600),
        )
        .unwrap();
        assert!(decode_token(&token, "another-secret-key-another-secret").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        // Expiry beyond the validation leeway.
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "dev@merchant.test".to_string(),
            role: UserRole::User,
            iat: now - 600,
            exp: now - 300,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(decode_token(&token, SECRET).is_err());
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(decode_token("not.a.jwt", SECRET).is_err());
        assert!(decode_token("", SECRET).is_err());
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter22").unwrap();
        assert_ne!(hash, "hunter22");
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
        assert!(!verify_password("hunter22", "not-a-hash"));
    }
}
