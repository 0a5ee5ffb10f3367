//! Port-80 listener: ACME HTTP-01 challenges and the HTTPS redirect.
//!
//! Only started when the relay terminates TLS itself. Challenge paths are
//! answered from the issuer's live token table; every other request is
//! permanently redirected to `https://` with path and query preserved.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::acme::AcmeIssuer;

const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Clone, Default)]
struct RedirectState {
    issuer: Option<Arc<AcmeIssuer>>,
}

/// Serve the redirect/challenge listener until shutdown.
pub async fn run(
    listener: TcpListener,
    issuer: Option<Arc<AcmeIssuer>>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, acme = issuer.is_some(), "HTTP redirect listener started");

    axum::serve(listener, router(issuer))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("HTTP redirect listener shutting down");
        })
        .await
}

fn router(issuer: Option<Arc<AcmeIssuer>>) -> Router {
    Router::new()
        .route(
            "/.well-known/acme-challenge/{token}",
            get(challenge_handler),
        )
        .fallback(redirect_handler)
        .with_state(RedirectState { issuer })
}

async fn challenge_handler(
    State(state): State<RedirectState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let token = uri.path().trim_start_matches(CHALLENGE_PREFIX);
    if let Some(key_auth) = state
        .issuer
        .as_ref()
        .and_then(|issuer| issuer.http01_key_authorization(token))
    {
        debug!(token = %token, "served ACME challenge");
        return ([(header::CONTENT_TYPE, "text/plain")], key_auth).into_response();
    }
    // Unknown token (or ACME disabled): fall through to the redirect.
    redirect_handler(uri, headers).await
}

async fn redirect_handler(uri: Uri, headers: HeaderMap) -> Response {
    let Some(host) = headers.get(header::HOST).and_then(|h| h.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };
    let host = host.split(':').next().unwrap_or(host);
    let target = format!("https://{}{}", host, redirect_path(&uri));
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, target)],
    )
        .into_response()
}

/// Path plus query, exactly as requested.
fn redirect_path(uri: &Uri) -> String {
    match uri.path_and_query() {
        Some(pq) => pq.as_str().to_string(),
        None => "/".to_string(),
    }
}
