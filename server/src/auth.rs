//! Handshake authentication.
//!
//! The credential is the same HS256 JWT the HTTP session layer issues, read
//! from the session cookie or an `Authorization: Bearer` header on the
//! upgrade request. A missing or bad token never refuses the transport: the
//! connection degrades to anonymous and the reason is reported.

use std::fmt;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Session token claims. The session layer writes the user id as `id`;
/// `sub` is accepted too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "sub")]
    pub id: String,
    pub iat: i64,
    pub exp: i64,
}

/// Result of authenticating one handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(String),
    Anonymous(DegradeReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradeReason {
    /// No cookie and no bearer header.
    Missing,
    /// Token present but past `exp`.
    Expired,
    /// Bad signature, malformed token, wrong claims.
    Invalid(String),
    /// No verification secret configured.
    NoSecret,
}

impl fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "no token"),
            Self::Expired => write!(f, "token expired"),
            Self::Invalid(e) => write!(f, "token invalid: {e}"),
            Self::NoSecret => write!(f, "no verification secret configured"),
        }
    }
}

pub struct TokenVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
    cookie_name: String,
}

impl TokenVerifier {
    pub fn new(config: &Config) -> Self {
        Self {
            key: config
                .jwt_secret
                .as_deref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
            cookie_name: config.token_cookie.clone(),
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> AuthOutcome {
        let Some(token) = self.extract_token(headers) else {
            return AuthOutcome::Anonymous(DegradeReason::Missing);
        };
        self.verify(&token)
    }

    /// Verify a raw token string.
    pub fn verify(&self, token: &str) -> AuthOutcome {
        let Some(key) = &self.key else {
            return AuthOutcome::Anonymous(DegradeReason::NoSecret);
        };
        match decode::<Claims>(token, key, &self.validation) {
            Ok(data) => AuthOutcome::Authenticated(data.claims.id),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => AuthOutcome::Anonymous(DegradeReason::Expired),
                _ => AuthOutcome::Anonymous(DegradeReason::Invalid(e.to_string())),
            },
        }
    }

    /// Cookie first, then bearer header.
    fn extract_token(&self, headers: &HeaderMap) -> Option<String> {
        let jar = CookieJar::from_headers(headers);
        if let Some(cookie) = jar.get(&self.cookie_name) {
            if !cookie.value().is_empty() {
                return Some(cookie.value().to_owned());
            }
        }
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
    }
}

/// Issue a session token with the shared claim shape.
///
/// Production tokens come from the HTTP session layer; this exists for local
/// tooling and tests, which must produce byte-compatible tokens.
pub fn issue_token(
    secret: &str,
    user_id: &str,
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        id: user_id.to_owned(),
        iat: now,
        exp: now + ttl.num_seconds(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
