// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Tunneld - Authentication Module
// Signed-token (JWT) gating of the control API

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::AuthConfig;

/// Claims carried by an issued token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Username the token was issued to
    pub sub: String,
    /// Expiry, seconds since the epoch
    pub exp: i64,
    /// Issued-at, seconds since the epoch
    pub iat: i64,
}

/// Shared authentication state for the middleware and the login handler
#[derive(Clone)]
pub struct AuthState {
    inner: Arc<AuthStateInner>,
}

struct AuthStateInner {
    secret: Zeroizing<String>,
    username: String,
    password_sha256: String,
    token_lifetime: Duration,
}

impl AuthState {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            inner: Arc::new(AuthStateInner {
                secret: Zeroizing::new(config.secret.clone()),
                username: config.username.clone(),
                password_sha256: config.password_sha256.to_lowercase(),
                token_lifetime: Duration::from_secs(config.token_lifetime_secs),
            }),
        }
    }

    /// Check login credentials: username plus SHA-256 of the password
    pub fn verify_credentials(&self, username: &str, password: &str) -> bool {
        if username != self.inner.username {
            return false;
        }
        let digest = hex_digest(password);
        // Both sides are fixed-length hex; byte comparison leaks nothing useful
        constant_time_eq(digest.as_bytes(), self.inner.password_sha256.as_bytes())
    }

    pub fn token_lifetime_secs(&self) -> u64 {
        self.inner.token_lifetime.as_secs()
    }

    /// Issue a signed token for a verified user
    pub fn issue_token(&self, username: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: username.to_string(),
            iat: now,
            exp: now + self.inner.token_lifetime.as_secs() as i64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.inner.secret.as_bytes()),
        )
    }

    /// Validate a bearer token, returning its claims
    pub fn verify_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.inner.secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(data.claims)
    }
}

fn hex_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Authenticated caller identity, inserted into request extensions
#[derive(Debug, Clone)]
pub struct UserContext {
    pub username: String,
}

/// Axum middleware requiring a valid `Authorization: Bearer` token.
/// The login endpoint itself is exempted by the router wiring.
pub async fn auth_middleware(
    axum::extract::State(auth): axum::extract::State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let token = match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token.to_string(),
        None => {
            debug!("request without bearer token rejected");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    match auth.verify_token(&token) {
        Ok(claims) => {
            request
                .extensions_mut()
                .insert(UserContext { username: claims.sub });
            Ok(next.run(request).await)
        }
        Err(e) => {
            warn!("token rejected: {}", e);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
