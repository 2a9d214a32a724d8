//! Session authentication gate
//!
//! A single shared password unlocks privileged operations. Presenting it to
//! [`SessionGate::authorize`] yields a signed, time-limited credential that
//! the browser carries back in a cookie.

use chrono::Utc;
use hyper::header::{HeaderMap, COOKIE};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_COOKIE_NAME: &str = "graphmux_session";

const SUBJECT: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("password rejected")]
    Rejected,
    #[error("failed to issue credential: {0}")]
    Token(String),
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub password: String,
    /// How long an issued credential stays valid
    pub window: Duration,
    pub cookie_name: String,
    pub cookie_secure: bool,
}

impl AuthConfig {
    pub fn new(password: impl Into<String>, window: Duration) -> Self {
        Self {
            password: password.into(),
            window,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_secure: false,
        }
    }
}

#[derive(Clone)]
pub struct SessionGate {
    config: Arc<AuthConfig>,
    digest: [u8; 32],
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

fn hash_secret(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

impl SessionGate {
    pub fn new(config: AuthConfig) -> Self {
        // Credentials are signed with the password hash, so changing the
        // password invalidates every outstanding session
        let digest = hash_secret(&config.password);
        Self {
            encoding_key: EncodingKey::from_secret(&digest),
            decoding_key: DecodingKey::from_secret(&digest),
            digest,
            config: Arc::new(config),
        }
    }

    /// Exchange a candidate password for a fresh credential
    pub fn authorize(&self, candidate: &str) -> Result<String, AuthError> {
        if hash_secret(candidate) != self.digest {
            warn!("Rejected login attempt");
            return Err(AuthError::Rejected);
        }

        let now = Utc::now();
        let exp = chrono::Duration::from_std(self.config.window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .ok_or_else(|| AuthError::Token("login window out of range".to_string()))?;
        let claims = Claims {
            sub: SUBJECT.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Token(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> bool {
        let mut validation = Validation::default();
        validation.leeway = 0;
        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => data.claims.sub == SUBJECT,
            Err(e) => {
                debug!(error = %e, "Session credential rejected");
                false
            }
        }
    }

    /// True when the request carries a valid, unexpired credential
    pub fn is_authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| self.extract_token_from_cookie(v))
            .any(|token| self.verify(&token))
    }

    pub fn create_session_cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
            self.config.cookie_name,
            token,
            self.config.window.as_secs()
        );
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    pub fn create_logout_cookie(&self) -> String {
        format!(
            "{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Strict",
            self.config.cookie_name
        )
    }

    pub fn extract_token_from_cookie(&self, cookie_header: &str) -> Option<String> {
        let prefix = format!("{}=", self.config.cookie_name);
        cookie_header
            .split(';')
            .map(str::trim)
            .filter_map(|c| c.strip_prefix(prefix.as_str()))
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }
}
