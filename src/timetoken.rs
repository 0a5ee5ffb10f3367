//! Time-limited access tokens for public download URLs.
//!
//! DICOM content endpoints are reachable without login, so download links
//! carry a `token` query parameter: a JSON payload `{exp, path, iat, jti}`
//! sealed with AES-256-GCM under a key derived from the hospital's shared
//! secret, then base64-URL encoded with the nonce prefixed. Validation
//! decrypts, checks expiry and compares the bound path against the actual
//! request path. Replay prevention beyond expiry is out of scope.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("token missing")]
    Missing,

    #[error("invalid token encoding")]
    Encoding,

    #[error("token failed to decrypt")]
    Decrypt,

    #[error("invalid token payload")]
    Payload,

    #[error("token has expired")]
    Expired,

    #[error("token path mismatch")]
    PathMismatch,
}

/// Claims sealed inside a token.
#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    /// Expiration, unix seconds.
    exp: i64,
    /// Resource path the token is bound to.
    path: String,
    /// Issued at, unix seconds.
    iat: i64,
    /// Unique token id.
    jti: String,
}

fn cipher_for(secret: &str) -> Aes256Gcm {
    // The shared secret is free-form; hash it down to exactly 32 key bytes.
    let key_bytes = Sha256::digest(secret.as_bytes());
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes))
}

/// Mint a token for `path`, valid for `ttl_secs` from now.
pub fn generate_token(secret: &str, path: &str, ttl_secs: i64) -> Result<String, TokenError> {
    let now = Utc::now().timestamp();
    let payload = TokenPayload {
        exp: now + ttl_secs,
        path: path.to_string(),
        iat: now,
        jti: Uuid::new_v4().to_string(),
    };
    let plaintext = serde_json::to_vec(&payload).map_err(|_| TokenError::Payload)?;

    let cipher = cipher_for(secret);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, plaintext.as_ref())
        .map_err(|_| TokenError::Decrypt)?;

    let mut packed = Vec::with_capacity(NONCE_LEN + sealed.len());
    packed.extend_from_slice(&nonce);
    packed.extend_from_slice(&sealed);
    Ok(URL_SAFE.encode(packed))
}

/// Validate a token against the request path it is supposed to cover.
pub fn validate_token(secret: &str, token: &str, requested_path: &str) -> Result<(), TokenError> {
    let packed = URL_SAFE.decode(token).map_err(|_| TokenError::Encoding)?;
    if packed.len() < NONCE_LEN {
        return Err(TokenError::Encoding);
    }
    let (nonce, sealed) = packed.split_at(NONCE_LEN);

    let cipher = cipher_for(secret);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| TokenError::Decrypt)?;
    let payload: TokenPayload =
        serde_json::from_slice(&plaintext).map_err(|_| TokenError::Payload)?;

    if Utc::now().timestamp() > payload.exp {
        return Err(TokenError::Expired);
    }
    if payload.path != requested_path {
        return Err(TokenError::PathMismatch);
    }
    Ok(())
}

/// Whether a public path must present a token. Basic liveness endpoints and
/// the viewer's API surface stay open; DICOM instance downloads do not.
pub fn is_token_required(path: &str) -> bool {
    if path == "/ping" || path == "/health" || path == "/" {
        return false;
    }

    // Web UI API endpoints authenticate on their own.
    const OPEN_PREFIX_PARTS: &[&str] = &[
        "/api/v1/health/",
        "/api/stats/",
        "/api/v1/config/",
        "/api/health",
        "/api/v1/transfers/",
        "/api/v1/hl7/",
        "/api/v1/system/",
        "/api/v1/commands",
    ];
    if OPEN_PREFIX_PARTS.iter().any(|p| path.contains(p)) {
        return false;
    }

    // Object-store presigned URLs carry their own signature.
    if path.contains("X-Amz-Algorithm")
        && path.contains("X-Amz-Credential")
        && path.contains("X-Amz-Signature")
    {
        return false;
    }

    path.contains("/instances/") && path.contains("/download")
}

/// Pull the `token` parameter out of a raw query string.
pub fn token_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut split = pair.splitn(2, '=');
        if split.next() == Some("token") {
            return split.next().map(str::to_string);
        }
    }
    None
}
