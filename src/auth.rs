//! Access-token issuance/verification and password hashing.
//!
//! Tokens are HS256 JWTs carrying the username in `sub` plus the numeric
//! user id. Password hashes are salted SHA-256 stored as `salt$hex`.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::AuthError;

/// The authenticated user extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenData {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    id: i64,
    exp: i64,
}

/// Issue an access token for the given user, valid for `expire_minutes`.
pub fn create_access_token(
    secret: &str,
    user_id: i64,
    username: &str,
    expire_minutes: i64,
) -> Result<String, AuthError> {
    let exp = (Utc::now() + Duration::minutes(expire_minutes)).timestamp();
    let claims = Claims {
        sub: username.to_string(),
        id: user_id,
        exp,
    };
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Verify a token and return the identity it carries.
pub fn verify_token(secret: &str, token: &str) -> Result<TokenData, AuthError> {
    let decoded = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::InvalidToken,
    })?;
    Ok(TokenData {
        id: decoded.claims.id,
        username: decoded.claims.sub,
    })
}

/// Hash a password with a fresh random salt. Output format: `salt$hex`.
pub fn hash_password(password: &str) -> String {
    let salt = uuid::Uuid::new_v4().simple().to_string();
    format!("{}${}", salt, digest(&salt, password))
}

/// Check a plaintext password against a stored `salt$hex` hash.
pub fn verify_password(password: &str, hashed: &str) -> bool {
    match hashed.split_once('$') {
        Some((salt, expected)) => digest(salt, password) == expected,
        None => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}
