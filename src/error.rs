//! Error types for the relay.
//!
//! Errors are grouped by what the caller should do with them: configuration
//! problems are fatal at startup, auth rejections are surfaced to the edge as
//! `ERROR <reason>` text frames, and everything on the public request path
//! collapses into [`RelayError`] with a [`RelayError::to_response`] mapping.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Fatal configuration problems. Only produced at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidAddr { addr: String, reason: String },

    #[error("domain must not be empty")]
    MissingDomain,

    #[error("tls.cert_file and tls.key_file are required when TLS is enabled without auto_cert")]
    MissingKeyMaterial,

    #[error("tls.acme_email is required when tls.auto_cert is enabled")]
    MissingAcmeEmail,

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("hospital {code:?}: subdomain {subdomain:?} does not match {expected:?}")]
    SubdomainMismatch {
        code: String,
        subdomain: String,
        expected: String,
    },
}

/// Registration-time rejections, sent to the edge as `ERROR <reason>` and
/// followed by a close. The edge retries on its own schedule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid registration format")]
    MalformedRegistration,

    #[error("too many failed attempts")]
    RateLimited,

    #[error("hospital not configured or token missing")]
    UnknownHospital,

    #[error("invalid subdomain")]
    SubdomainMismatch,

    #[error("invalid token")]
    InvalidToken,

    #[error("hospital already registered")]
    AlreadyRegistered,

    #[error("relay at capacity")]
    AtCapacity,
}

impl AuthError {
    /// The reason string carried on the wire after `ERROR `.
    pub fn wire_reason(&self) -> &'static str {
        match self {
            AuthError::MalformedRegistration => "Invalid registration format",
            AuthError::RateLimited => "Too many failed attempts",
            AuthError::UnknownHospital => "Hospital not configured or token missing",
            AuthError::SubdomainMismatch => "Invalid subdomain",
            AuthError::InvalidToken => "Invalid token",
            AuthError::AlreadyRegistered => "Hospital already registered",
            AuthError::AtCapacity => "Relay at capacity",
        }
    }

    /// Whether this rejection counts against the caller's failed-attempt
    /// budget. Rate-limit replies and capacity rejections do not.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            AuthError::UnknownHospital | AuthError::SubdomainMismatch | AuthError::InvalidToken
        )
    }
}

/// Certificate issuance failures. Fail the handshake for the offending host;
/// other hosts keep serving.
#[derive(Error, Debug)]
pub enum CertError {
    #[error("unauthorized host {0:?}")]
    UnauthorizedHost(String),

    #[error("no server name in TLS handshake")]
    MissingServerName,

    #[error("certificate cache: {0}")]
    Cache(#[from] std::io::Error),

    #[error("invalid key material for {host}: {reason}")]
    KeyMaterial { host: String, reason: String },

    #[error("acme: {0}")]
    Acme(String),
}

/// Errors on the public request path.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Host header does not name a subdomain of the configured domain.
    #[error("invalid subdomain in host {0:?}")]
    InvalidSubdomain(String),

    /// No live tunnel registered for the extracted id.
    #[error("hospital {0:?} not connected")]
    NotConnected(String),

    /// Download path without a valid access token.
    #[error("access token rejected: {0}")]
    TokenRejected(String),

    /// Mid-session transport failure: the tunnel died or a frame could not
    /// be written within its deadline.
    #[error("tunnel transport: {0}")]
    Transport(String),

    /// The edge produced a malformed response or an explicit error frame.
    #[error("upstream: {0}")]
    Upstream(String),

    /// No response head or body frame arrived within `request_timeout`.
    #[error("request timed out waiting for the edge")]
    Timeout,

    /// The public client went away; nothing to send.
    #[error("client disconnected")]
    ClientDisconnect,

    /// Relay is draining; new requests are rejected.
    #[error("shutting down")]
    ShuttingDown,

    /// Request could not be serialized for the tunnel.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl RelayError {
    /// Map to the status code and body the public client sees. Only used
    /// when response headers have not been written yet; after that the
    /// body is aborted instead.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let (status, message) = match self {
            RelayError::InvalidSubdomain(_) => (StatusCode::BAD_REQUEST, "Invalid subdomain"),
            RelayError::NotConnected(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Hospital not connected")
            }
            RelayError::TokenRejected(_) => (StatusCode::FORBIDDEN, "Invalid or expired token"),
            RelayError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad request"),
            RelayError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "Relay shutting down"),
            RelayError::ClientDisconnect => (StatusCode::BAD_REQUEST, "Client disconnected"),
            RelayError::Transport(_) | RelayError::Upstream(_) | RelayError::Timeout => {
                (StatusCode::BAD_GATEWAY, "Bad gateway")
            }
        };

        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("Internal server error")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Result alias for the public request path.
pub type RelayResult<T> = Result<T, RelayError>;
