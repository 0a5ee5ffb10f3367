//! gantry-relay: reverse-tunnel relay for firewalled imaging endpoints.
//!
//! Hospital agents ("edges") dial out to this relay over a single TLS
//! connection and register a subdomain. Public clients reach each hospital
//! at `https://<code>.<domain>/...`; the relay parks every inbound request
//! on the matching tunnel and streams the response frames back as they
//! arrive.

pub mod acme;
pub mod admin;
pub mod auth;
pub mod config;
pub mod error;
pub mod frontend;
pub mod lifecycle;
pub mod proxy;
pub mod redirect;
pub mod registry;
pub mod timetoken;
pub mod tunnel;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;

use crate::auth::AuthLimiter;
use crate::config::Config;
use crate::error::RelayError;
use crate::lifecycle::LifecycleManager;
use crate::registry::TunnelRegistry;

/// Unified response body on the public listener: buffered error pages and
/// streamed tunnel responses behind one type.
pub type RelayBody = UnsyncBoxBody<Bytes, RelayError>;

/// Shared state threaded through every component.
pub struct RelayState {
    pub config: Arc<Config>,
    pub registry: Arc<TunnelRegistry>,
    pub auth: Arc<AuthLimiter>,
    pub lifecycle: Arc<LifecycleManager>,
}

impl RelayState {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<TunnelRegistry>,
        auth: Arc<AuthLimiter>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            config,
            registry,
            auth,
            lifecycle,
        }
    }
}
