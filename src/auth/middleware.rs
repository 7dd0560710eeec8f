//! Authentication Middleware
//! Mission: Header extraction for approval tokens and consumer API keys

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const DEVICE_FINGERPRINT_HEADER: &str = "x-device-fingerprint";

/// `Authorization: Bearer <token>` value, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn device_fingerprint(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(DEVICE_FINGERPRINT_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|d| !d.is_empty())
}

/// Optional API key guarding the consumer read endpoints.
#[derive(Debug, Clone, Default)]
pub struct ConsumerAuth {
    key_digest: Option<[u8; 32]>,
}

impl ConsumerAuth {
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            key_digest: api_key
                .filter(|k| !k.is_empty())
                .map(|k| Sha256::digest(k.as_bytes()).into()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key_digest.is_some()
    }

    /// Digests are compared so the comparison does not leak the key length.
    fn accepts(&self, presented: Option<&str>) -> bool {
        match (&self.key_digest, presented) {
            (None, _) => true,
            (Some(expected), Some(key)) => {
                let digest: [u8; 32] = Sha256::digest(key.as_bytes()).into();
                digest
                    .iter()
                    .zip(expected.iter())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
            }
            (Some(_), None) => false,
        }
    }
}

/// Rejects consumer requests without the configured API key.
pub async fn consumer_auth_middleware(
    State(auth): State<Arc<ConsumerAuth>>,
    req: Request,
    next: Next,
) -> Result<Response, ConsumerAuthError> {
    let presented = bearer_token(req.headers());
    if !auth.accepts(presented) {
        return Err(if presented.is_none() {
            ConsumerAuthError::MissingKey
        } else {
            ConsumerAuthError::InvalidKey
        });
    }
    Ok(next.run(req).await)
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConsumerAuthError {
    MissingKey,
    InvalidKey,
}

impl IntoResponse for ConsumerAuthError {
    fn into_response(self) -> Response {
        let (reason, message) = match self {
            ConsumerAuthError::MissingKey => (
                "missing_api_key",
                "Missing consumer API key. Use: Authorization: Bearer {key}",
            ),
            ConsumerAuthError::InvalidKey => ("invalid_api_key", "Invalid consumer API key"),
        };

        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": reason,
                "category": "auth",
                "message": message,
                "retryable": false,
            })),
        )
            .into_response()
    }
}
