//! HTTP Basic authentication against the configured user table.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::Arc};

const DIGEST_PREFIX: &str = "sha256:";
pub const REALM_CHALLENGE: &str = "Basic realm=\"Authentication Required\"";

type PasswordDigest = [u8; 32];

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("password digest for user '{user}' is not 64 hex characters")]
    BadDigest { user: String },
}

/// Users mapped to SHA-256 digests of their passwords. Plaintext entries are hashed on load.
pub struct Credentials {
    users: BTreeMap<String, PasswordDigest>,
}

fn digest(password: &str) -> PasswordDigest {
    Sha256::digest(password.as_bytes()).into()
}

fn constant_time_eq(a: &PasswordDigest, b: &PasswordDigest) -> bool {
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl Credentials {
    pub fn from_users(users: &BTreeMap<String, String>) -> Result<Self, CredentialError> {
        let users = users
            .iter()
            .map(|(user, secret)| {
                let stored = match secret.strip_prefix(DIGEST_PREFIX) {
                    Some(hex_digest) => hex::decode(hex_digest.trim())
                        .ok()
                        .and_then(|bytes| PasswordDigest::try_from(bytes).ok())
                        .ok_or_else(|| CredentialError::BadDigest { user: user.clone() })?,
                    None => digest(secret),
                };
                Ok((user.clone(), stored))
            })
            .collect::<Result<_, CredentialError>>()?;
        Ok(Self { users })
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        let offered = digest(password);
        match self.users.get(username) {
            Some(stored) => constant_time_eq(stored, &offered),
            None => {
                // Same amount of work for unknown users.
                let _ = constant_time_eq(&offered, &[0u8; 32]);
                false
            }
        }
    }
}

/// Extracts `(username, password)` from an `Authorization: Basic ...` header.
pub fn parse_basic(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

pub fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, REALM_CHALLENGE)],
        Json(json!({
            "error": "Authentication required",
            "message": "Please provide valid credentials",
        })),
    )
        .into_response()
}

/// Middleware gating every route.
pub async fn require_basic_auth(
    State(credentials): State<Arc<Credentials>>,
    request: Request,
    next: Next,
) -> Response {
    match parse_basic(request.headers()) {
        Some((username, password)) if credentials.verify(&username, &password) => {
            next.run(request).await
        }
        Some((username, _)) => {
            tracing::warn!(user = %username, path = %request.uri().path(), "rejected credentials");
            unauthorized()
        }
        None => unauthorized(),
    }
}
