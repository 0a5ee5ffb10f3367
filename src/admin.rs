//! Admin endpoint: liveness and tunnel introspection.
//!
//! Runs on its own plaintext address (`metrics_addr`) so probes and
//! operator tooling never touch the public listener. `/status` sets a
//! permissive CORS header so browser dashboards can poll it directly. The
//! same two handlers back the primary listener's `/health` and `/status`.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::registry::TunnelRegistry;

/// `/status` response body.
#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub connected_hospitals: usize,
    pub hospitals: Vec<HospitalStatus>,
}

#[derive(Debug, Serialize)]
pub struct HospitalStatus {
    pub code: String,
    pub subdomain: String,
    pub last_seen: DateTime<Utc>,
    pub remote_addr: String,
}

/// Point-in-time status snapshot; concurrent registrations may or may not
/// be included.
pub fn status_body(registry: &TunnelRegistry) -> StatusBody {
    let hospitals: Vec<HospitalStatus> = registry
        .snapshot()
        .into_iter()
        .map(|info| HospitalStatus {
            code: info.code,
            subdomain: info.subdomain,
            last_seen: info.last_seen,
            remote_addr: info.remote_addr,
        })
        .collect();
    StatusBody {
        connected_hospitals: hospitals.len(),
        hospitals,
    }
}

/// Serialized `/status` with its headers, shared by both listeners.
pub fn status_headers() -> [(header::HeaderName, &'static str); 4] {
    [
        (header::CONTENT_TYPE, "application/json"),
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
    ]
}

/// Serve the admin endpoint until shutdown.
pub async fn run(
    listener: TcpListener,
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "admin server listening (/health, /status)");

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("admin server shutting down");
        })
        .await
}

fn router(registry: Arc<TunnelRegistry>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(registry)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status_handler(State(registry): State<Arc<TunnelRegistry>>) -> impl IntoResponse {
    let body = serde_json::to_string(&status_body(&registry))
        .unwrap_or_else(|_| r#"{"connected_hospitals":0,"hospitals":[]}"#.to_string());
    (StatusCode::OK, status_headers(), body)
}
