// src/utils/jwt.rs

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{config::Config, error::AppError};

/// Name of the cookie holding the session token.
pub const SESSION_COOKIE: &str = "session";

/// Session JWT claims.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Claims {
    /// Subject - the local user id.
    pub sub: String,
    pub email: String,
    /// Expiration time as Unix timestamp.
    pub exp: usize,
}

/// Signs a session token for the user.
pub fn sign_jwt(
    user_id: &str,
    email: &str,
    secret: &str,
    expiration_seconds: u64,
) -> Result<String, AppError> {
    // Calculate expiration: current time + expiration_seconds
    let expiration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AppError::InternalServerError(e.to_string()))?
        .as_secs() as usize
        + expiration_seconds as usize;

    let claims = Claims {
        sub: user_id.to_owned(),
        email: email.to_owned(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::InternalServerError(e.to_string()))
}

/// Verifies and decodes a session token.
pub fn verify_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::AuthError("Invalid token".to_string()))?;

    Ok(token_data.claims)
}

/// `Set-Cookie` value carrying a fresh session.
pub fn session_cookie(token: &str, max_age: u64) -> String {
    format!(
        "{}={}; HttpOnly; Path=/; Max-Age={}; SameSite=Lax",
        SESSION_COOKIE, token, max_age
    )
}

/// `Set-Cookie` value that removes the session.
pub fn clear_session_cookie() -> String {
    format!("{}=; HttpOnly; Path=/; Max-Age=0; SameSite=Lax", SESSION_COOKIE)
}

fn cookie_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// The caller, if any.
///
/// Reads `Authorization: Bearer <token>` first and falls back to the session cookie.
/// A malformed bearer token is rejected with 401; an unusable cookie just means
/// the caller is anonymous.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<Claims>);

impl MaybeUser {
    pub fn id(&self) -> Option<&str> {
        self.0.as_ref().map(|c| c.sub.as_str())
    }
}

impl<S> FromRequestParts<S> for MaybeUser
where
    Config: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = Config::from_ref(state);

        let bearer = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        if let Some(token) = bearer {
            return verify_jwt(token, &config.jwt_secret).map(|claims| MaybeUser(Some(claims)));
        }

        let claims = cookie_value(parts, SESSION_COOKIE)
            .filter(|token| !token.is_empty())
            .and_then(|token| verify_jwt(token, &config.jwt_secret).ok());

        Ok(MaybeUser(claims))
    }
}
