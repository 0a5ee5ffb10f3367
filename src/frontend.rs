//! Public listener.
//!
//! Terminates TLS (static keypair, on-demand ACME, or not at all when an
//! external terminator fronts the relay) and routes by path:
//!
//! - `/tunnel`: WebSocket upgrade into an edge session
//! - `/health`, `/status`: local diagnostics, same handlers as the admin port
//! - everything else: public traffic, forwarded over the tunnel named by
//!   the Host header

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::RelayState;
use crate::acme::{self, AcmeIssuer};
use crate::config::Config;
use crate::error::{CertError, ConfigError, RelayError};
use crate::proxy;
use crate::timetoken;
use crate::tunnel::session;
use crate::{RelayBody, admin};

/// How the primary listener terminates TLS.
pub enum TlsMode {
    /// Plaintext; an external terminator owns the certificates and the
    /// `X-Forwarded-Proto` header is trusted for scheme decisions.
    Disabled,
    /// One static keypair loaded at startup.
    Static(TlsAcceptor),
    /// Certificates issued per Host on first contact.
    Acme(Arc<AcmeIssuer>),
}

/// Build the TLS mode from configuration. The issuer is returned separately
/// so the redirect listener can answer its HTTP-01 challenges.
pub fn build_tls_mode(config: &Config) -> Result<(TlsMode, Option<Arc<AcmeIssuer>>), ConfigError> {
    if !config.tls.enabled {
        info!("TLS disabled, assuming external termination in front of the relay");
        return Ok((TlsMode::Disabled, None));
    }

    if config.tls.auto_cert {
        let issuer = Arc::new(AcmeIssuer::new(
            &config.domain,
            &config.tls.acme_email,
            acme::DEFAULT_CACHE_DIR,
        ));
        info!(domain = %config.domain, "on-demand ACME certificates enabled");
        return Ok((TlsMode::Acme(Arc::clone(&issuer)), Some(issuer)));
    }

    let cert_pem = std::fs::read(&config.tls.cert_file)?;
    let key_pem = std::fs::read(&config.tls.key_file)?;
    let (chain, key) = acme::parse_pem_pair(&cert_pem, &key_pem)?;
    let server_config = acme::build_server_config(&config.domain, chain, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;
    info!(cert = %config.tls.cert_file, "static TLS certificate loaded");
    Ok((TlsMode::Static(TlsAcceptor::from(server_config)), None))
}

/// The primary accept loop. Returns when shutdown is signaled.
pub async fn run(
    state: Arc<RelayState>,
    tls: TlsMode,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "public listener started");
    let tls = Arc::new(tls);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                if state.lifecycle.is_shutting_down() {
                    warn!(peer = %peer_addr, "rejected connection: shutting down");
                    if matches!(*tls, TlsMode::Disabled) {
                        tokio::spawn(async move {
                            let _ = send_plaintext_503(stream).await;
                        });
                    }
                    continue;
                }

                if let Err(e) = configure_tcp_stream(&stream) {
                    debug!(error = %e, "failed to tune accepted socket");
                }

                let state = Arc::clone(&state);
                let tls = Arc::clone(&tls);
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(state, tls, stream, peer_addr, conn_shutdown).await;
                });
            }

            _ = shutdown.cancelled() => {
                info!("public listener stopping");
                return Ok(());
            }
        }
    }
}

/// TCP keepalive and latency tuning for accepted sockets.
fn configure_tcp_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    socket.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

async fn handle_connection(
    state: Arc<RelayState>,
    tls: Arc<TlsMode>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    match &*tls {
        TlsMode::Disabled => serve_connection(state, stream, peer_addr, shutdown).await,
        TlsMode::Static(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => serve_connection(state, tls_stream, peer_addr, shutdown).await,
            Err(e) => debug!(peer = %peer_addr, error = %e, "TLS handshake failed"),
        },
        TlsMode::Acme(issuer) => {
            if let Err(e) = accept_with_acme(state, issuer, stream, peer_addr, shutdown).await {
                debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
            }
        }
    }
}

/// SNI-driven handshake: read the client hello, resolve (or issue) the
/// certificate for that host, then complete the handshake. A per-host
/// failure aborts only this connection.
async fn accept_with_acme(
    state: Arc<RelayState>,
    issuer: &Arc<AcmeIssuer>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), CertError> {
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
        .await
        .map_err(CertError::Cache)?;

    let host = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .ok_or(CertError::MissingServerName)?;

    let config = issuer.server_config_for(&host).await?;
    let tls_stream = start.into_stream(config).await.map_err(CertError::Cache)?;
    serve_connection(state, tls_stream, peer_addr, shutdown).await;
    Ok(())
}

/// Drive one HTTP connection (any protocol hyper auto-negotiates), with
/// upgrade support for `/tunnel` and graceful close on shutdown.
async fn serve_connection<IO>(
    state: Arc<RelayState>,
    io: IO,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move {
            let response = handle_request(state, peer_addr, req).await;
            Ok::<_, std::convert::Infallible>(response)
        }
    });

    let builder = auto::Builder::new(hyper_util::rt::TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                debug!(peer = %peer_addr, error = %e, "connection ended with error");
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
        }
    }
}

async fn handle_request(
    state: Arc<RelayState>,
    peer_addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<RelayBody> {
    match req.uri().path() {
        "/tunnel" => handle_tunnel_upgrade(state, peer_addr, req),
        "/health" => text_response(StatusCode::OK, "OK"),
        "/status" => status_response(&state),
        _ => match handle_public(state, req).await {
            Ok(response) => response,
            Err(e) => error_response(e),
        },
    }
}

/// WebSocket upgrade into an edge session. Registration and auth happen on
/// the upgraded stream's first frame, exactly as on the wire protocol.
fn handle_tunnel_upgrade(
    state: Arc<RelayState>,
    peer_addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<RelayBody> {
    let headers = req.headers();
    let is_ws_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
        && headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);

    let Some(ws_key) = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return text_response(StatusCode::BAD_REQUEST, "WebSocket upgrade required");
    };

    if !is_ws_upgrade {
        return text_response(StatusCode::BAD_REQUEST, "WebSocket upgrade required");
    }

    let accept_key = derive_accept_key(ws_key.as_bytes());

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let socket = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                session::run(state, socket, peer_addr).await;
            }
            Err(e) => debug!(peer = %peer_addr, error = %e, "tunnel upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(empty_body())
        .unwrap_or_else(|_| error_response(RelayError::BadRequest("upgrade".into())))
}

/// Public traffic: resolve the tunnel from Host, enforce download tokens,
/// forward, stream back.
async fn handle_public(
    state: Arc<RelayState>,
    req: Request<Incoming>,
) -> Result<Response<RelayBody>, RelayError> {
    let Some(guard) = state.lifecycle.track_request() else {
        return Err(RelayError::ShuttingDown);
    };

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default();

    debug!(
        scheme = request_scheme(&req, state.config.tls.enabled),
        host = %host,
        method = %req.method(),
        path = %req.uri().path(),
        "public request"
    );

    let code = proxy::tunnel_id_from_host(&host, &state.config.domain)
        .ok_or_else(|| RelayError::InvalidSubdomain(host.clone()))?;

    let tunnel = state
        .registry
        .lookup(&code)
        .ok_or_else(|| RelayError::NotConnected(code.clone()))?;

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    if timetoken::is_token_required(&path_and_query) {
        let secret = state
            .config
            .hospital(&code)
            .map(|h| h.token.clone())
            .unwrap_or_default();
        let token = timetoken::token_from_query(req.uri().query())
            .ok_or_else(|| RelayError::TokenRejected("token missing".into()))?;
        timetoken::validate_token(&secret, &token, req.uri().path())
            .map_err(|e| RelayError::TokenRejected(e.to_string()))?;
    }

    proxy::dispatch(tunnel, req, state.config.request_timeout, Some(guard)).await
}

fn status_response(state: &Arc<RelayState>) -> Response<RelayBody> {
    let body = serde_json::to_string(&admin::status_body(&state.registry))
        .unwrap_or_else(|_| r#"{"connected_hospitals":0,"hospitals":[]}"#.to_string());

    let mut response = Response::builder().status(StatusCode::OK);
    for (name, value) in admin::status_headers() {
        response = response.header(name, value);
    }
    response
        .body(full_body(Bytes::from(body)))
        .unwrap_or_else(|_| error_response(RelayError::BadRequest("status".into())))
}

fn error_response(error: RelayError) -> Response<RelayBody> {
    match &error {
        RelayError::ClientDisconnect => {}
        RelayError::InvalidSubdomain(_) | RelayError::NotConnected(_) => {
            warn!(error = %error, "public request rejected")
        }
        _ => warn!(error = %error, "public request failed"),
    }
    error.to_response().map(|full| {
        full.map_err(|never| match never {}).boxed_unsync()
    })
}

fn text_response(status: StatusCode, body: &'static str) -> Response<RelayBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body(Bytes::from_static(body.as_bytes())))
        .unwrap_or_else(|_| error_response(RelayError::BadRequest("response build".into())))
}

fn full_body(bytes: Bytes) -> RelayBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn empty_body() -> RelayBody {
    full_body(Bytes::new())
}

/// The scheme a public request arrived on. With TLS disabled the external
/// terminator's `X-Forwarded-Proto` is trusted.
pub fn request_scheme<B>(req: &Request<B>, tls_enabled: bool) -> &'static str {
    if tls_enabled {
        return "https";
    }
    match req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
    {
        Some(proto) if proto.eq_ignore_ascii_case("https") => "https",
        _ => "http",
    }
}

async fn send_plaintext_503(mut stream: TcpStream) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = "Relay is shutting down.\n";
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Retry-After: 5\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
