use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{domain::UserId, error::AuthError};

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    iat: i64,
    exp: i64,
}

pub fn mint_token(
    cfg: &AuthConfig,
    user_id: UserId,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        sub: user_id.0,
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
}

pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<UserId, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|err| match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::ExpiredCredential,
        _ => AuthError::InvalidCredential,
    })?;
    Ok(UserId(data.claims.sub))
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
