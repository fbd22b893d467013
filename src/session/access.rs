//! Access tokens: HS256 JWTs carrying the user's identity claims.
//!
//! Signature checks happen here; expiry is judged by the caller against the
//! injected clock.

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub totp_enabled: bool,
    /// Session the token was minted for.
    pub sid: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

pub trait AccessTokenIssuer: Send + Sync {
    /// # Errors
    /// Returns an error if signing fails.
    fn issue(&self, claims: &Claims) -> Result<String>;

    /// Verify the signature and decode. Does not check `exp`.
    ///
    /// # Errors
    /// Returns an error for malformed or forged tokens.
    fn decode(&self, token: &str) -> Result<Claims>;
}

pub struct JwtIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtIssuer {
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let key = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
        }
    }
}

impl AccessTokenIssuer for JwtIssuer {
    fn issue(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .context("Failed to sign access token")
    }

    fn decode(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .context("Failed to decode access token")?;
        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn claims() -> Claims {
        Claims {
            sub: Uuid::now_v7(),
            email: "alice@example.com".to_string(),
            username: Some("alice".to_string()),
            totp_enabled: false,
            sid: Uuid::now_v7(),
            iat: 1_700_000_000,
            exp: 1_700_000_300,
            jti: Uuid::new_v4().to_string(),
        }
    }

    #[test]
    fn decode_returns_signed_claims_even_when_expired() {
        let issuer = JwtIssuer::new(&SecretString::from("test-secret-that-is-long-enough"));
        let claims = claims();
        let token = issuer.issue(&claims).unwrap();
        assert_eq!(issuer.decode(&token).unwrap(), claims);
    }

    #[test]
    fn foreign_key_is_rejected() {
        let ours = JwtIssuer::new(&SecretString::from("ours-ours-ours-ours"));
        let theirs = JwtIssuer::new(&SecretString::from("theirs-theirs-theirs"));
        let token = theirs.issue(&claims()).unwrap();
        assert!(ours.decode(&token).is_err());
        assert!(ours.decode("not-a-jwt").is_err());
    }
}
