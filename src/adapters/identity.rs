// src/adapters/identity.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;

use crate::ports::{IdentityError, IdentityProvider, VerifiedIdentity};

/// Sign-ins older than this many seconds cannot open a session.
const MAX_SIGN_IN_AGE_SECS: i64 = 60 * 60;

#[derive(Debug, Deserialize)]
struct SignInClaims {
    email: String,
    auth_time: i64,
}

/// Verifies HS256 sign-in tokens minted by the identity provider.
pub struct JwtIdentityProvider {
    secret: String,
    issuer: Option<String>,
}

impl JwtIdentityProvider {
    pub fn new(secret: String, issuer: Option<String>) -> Self {
        Self { secret, issuer }
    }

    fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<VerifiedIdentity, IdentityError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let claims = decode::<SignInClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| IdentityError::InvalidToken(e.to_string()))?
        .claims;

        let auth_time = DateTime::<Utc>::from_timestamp(claims.auth_time, 0)
            .ok_or_else(|| IdentityError::InvalidToken("bad auth_time".to_string()))?;

        if (now - auth_time).num_seconds() >= MAX_SIGN_IN_AGE_SECS {
            return Err(IdentityError::Stale);
        }

        Ok(VerifiedIdentity {
            email: claims.email.to_lowercase(),
            auth_time,
        })
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn verify_sign_in_token(&self, token: &str) -> Result<VerifiedIdentity, IdentityError> {
        self.verify_at(token, Utc::now())
    }
}
