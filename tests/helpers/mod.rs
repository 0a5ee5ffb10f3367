//! Integration-test harness: an in-process relay with shrunken timers and a
//! scripted edge agent speaking the real wire protocol.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use gantry_relay::RelayState;
use gantry_relay::auth::{AuthLimiter, AuthLimiterConfig};
use gantry_relay::config::Config;
use gantry_relay::frontend::{self, TlsMode};
use gantry_relay::lifecycle::LifecycleManager;
use gantry_relay::registry::TunnelRegistry;
use gantry_relay::admin;
use gantry_relay::tunnel::protocol::{DataFrame, DataKind};

pub type EdgeWs = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Knobs for one in-process relay.
pub struct RelayOptions {
    pub domain: String,
    /// `(code, token)` pairs; subdomains derive from the domain.
    pub hospitals: Vec<(String, String)>,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_concurrent_conn: usize,
    pub auth: AuthLimiterConfig,
    pub with_admin: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            domain: "example.test".to_string(),
            hospitals: vec![("a".to_string(), "t1".to_string())],
            request_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            max_concurrent_conn: 100,
            auth: AuthLimiterConfig::default(),
            with_admin: false,
        }
    }
}

pub struct TestRelay {
    pub addr: SocketAddr,
    pub admin_addr: Option<SocketAddr>,
    pub state: Arc<RelayState>,
    pub shutdown: CancellationToken,
}

impl TestRelay {
    /// `http://<code>.<domain>:<port>/...`; the port must live in the URL
    /// because reqwest's DNS override ignores the port of the pinned addr.
    pub fn public_url(&self, host_prefix: &str, path: &str) -> String {
        format!(
            "http://{host_prefix}.example.test:{}{path}",
            self.addr.port()
        )
    }

    /// Absolute URL for an arbitrary full host (foreign-domain tests).
    pub fn url_for_host(&self, host: &str, path: &str) -> String {
        format!("http://{host}:{}{path}", self.addr.port())
    }

    /// A client whose DNS pins the given hosts onto the relay listener.
    pub fn client_for(&self, hosts: &[&str]) -> reqwest::Client {
        let mut builder = reqwest::Client::builder();
        for host in hosts {
            builder = builder.resolve(host, self.addr);
        }
        builder.build().expect("reqwest client")
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/tunnel", self.addr)
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Boot a relay on ephemeral ports with TLS disabled.
pub async fn spawn_relay(options: RelayOptions) -> TestRelay {
    let hospitals: Vec<serde_json::Value> = options
        .hospitals
        .iter()
        .map(|(code, token)| {
            serde_json::json!({
                "code": code,
                "subdomain": format!("{code}.{}", options.domain),
                "token": token,
            })
        })
        .collect();

    let config: Config = serde_json::from_value(serde_json::json!({
        "listen_addr": "127.0.0.1:0",
        "domain": options.domain,
        "hospitals": hospitals,
        "idle_timeout": format!("{}ms", options.idle_timeout.as_millis()),
        "request_timeout": format!("{}ms", options.request_timeout.as_millis()),
        "max_concurrent_conn": options.max_concurrent_conn,
    }))
    .expect("test config");
    config.validate().expect("test config valid");

    let config = Arc::new(config);
    let lifecycle = Arc::new(LifecycleManager::new(Duration::from_secs(1)));
    let registry = Arc::new(TunnelRegistry::new());
    let auth = Arc::new(AuthLimiter::new(options.auth));
    let state = Arc::new(RelayState::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&auth),
        Arc::clone(&lifecycle),
    ));
    lifecycle.mark_ready();

    let shutdown = lifecycle.shutdown_token();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind public");
    let addr = listener.local_addr().expect("public addr");
    {
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = frontend::run(state, TlsMode::Disabled, listener, shutdown).await;
        });
    }

    let admin_addr = if options.with_admin {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind admin");
        let admin_addr = listener.local_addr().expect("admin addr");
        let admin_registry = Arc::clone(&registry);
        let admin_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = admin::run(listener, admin_registry, admin_shutdown).await;
        });
        Some(admin_addr)
    } else {
        None
    };

    TestRelay {
        addr,
        admin_addr,
        state,
        shutdown,
    }
}

/// Connect a raw edge socket and exchange one registration line. Returns
/// the socket together with the relay's text reply.
pub async fn raw_register(
    relay: &TestRelay,
    code: &str,
    subdomain: &str,
    token: &str,
) -> (EdgeWs, String) {
    let (mut ws, _) = connect_async(relay.ws_url()).await.expect("ws connect");
    ws.send(Message::Text(format!("REGISTER {code} {subdomain} {token}")))
        .await
        .expect("send register");
    let reply = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(_)) => continue,
            other => panic!("no registration reply: {other:?}"),
        }
    };
    (ws, reply)
}

/// One decoded request frame, as the edge sees it.
#[derive(Debug, Clone)]
pub struct EdgeRequest {
    pub request_id: u64,
    pub method: String,
    pub path: String,
    pub head: String,
    pub body: Vec<u8>,
}

impl EdgeRequest {
    fn parse(request_id: u64, payload: &[u8]) -> Self {
        let split = payload
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|at| at + 4)
            .unwrap_or(payload.len());
        let head = String::from_utf8_lossy(&payload[..split]).into_owned();
        let body = payload[split..].to_vec();

        let mut request_line = head.lines().next().unwrap_or("").split_whitespace();
        let method = request_line.next().unwrap_or("").to_string();
        let path = request_line.next().unwrap_or("").to_string();

        Self {
            request_id,
            method,
            path,
            head,
            body,
        }
    }

    /// Value of a request header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().skip(1).find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower
                .starts_with(&prefix)
                .then(|| line.splitn(2, ':').nth(1).unwrap_or("").trim().to_string())
        })
    }
}

/// The scripted response one handler invocation produces.
#[derive(Debug, Clone)]
pub struct EdgeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<Bytes>,
    pub chunk_delay: Duration,
    /// Send the terminal Complete frame (off to simulate a hung edge).
    pub complete: bool,
    /// Hard-close the whole connection after this many chunks.
    pub abort_connection_after: Option<usize>,
    /// Include a Content-Length header for the summed chunk size.
    pub content_length: bool,
    /// Send an explicit Error frame instead of any response.
    pub error: Option<String>,
}

impl EdgeResponse {
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            chunks: if body.is_empty() {
                Vec::new()
            } else {
                vec![Bytes::copy_from_slice(body.as_bytes())]
            },
            chunk_delay: Duration::ZERO,
            complete: true,
            abort_connection_after: None,
            content_length: true,
            error: None,
        }
    }

    /// An explicit error frame: the local endpoint could not be reached.
    pub fn error(reason: &str) -> Self {
        let mut response = Self::text(0, "");
        response.error = Some(reason.to_string());
        response
    }

    pub fn bytes(status: u16, content_type: &str, chunks: Vec<Bytes>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            chunks,
            chunk_delay: Duration::ZERO,
            complete: true,
            abort_connection_after: None,
            content_length: true,
            error: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn head_bytes(&self) -> Bytes {
        let reason = match self.status {
            200 => "OK",
            404 => "Not Found",
            500 => "Internal Server Error",
            _ => "Status",
        };
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason);
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if self.content_length {
            let total: usize = self.chunks.iter().map(Bytes::len).sum();
            head.push_str(&format!("Content-Length: {total}\r\n"));
        }
        head.push_str("\r\n");
        Bytes::from(head)
    }
}

pub type EdgeHandler = Arc<dyn Fn(EdgeRequest) -> BoxFuture<'static, EdgeResponse> + Send + Sync>;

/// Wrap a plain closure into an [`EdgeHandler`].
pub fn handler<F>(f: F) -> EdgeHandler
where
    F: Fn(EdgeRequest) -> EdgeResponse + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |req| {
        let f = Arc::clone(&f);
        Box::pin(async move { f(req) })
    })
}

/// Wrap an async closure into an [`EdgeHandler`].
pub fn async_handler<F, Fut>(f: F) -> EdgeHandler
where
    F: Fn(EdgeRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = EdgeResponse> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |req| {
        let f = Arc::clone(&f);
        Box::pin(async move { f(req).await })
    })
}

/// Echo handler: returns the request body with the request's content type.
pub fn echo_handler() -> EdgeHandler {
    handler(|req| {
        let content_type = req
            .header("content-type")
            .unwrap_or_else(|| "application/octet-stream".to_string());
        EdgeResponse::bytes(200, &content_type, vec![Bytes::from(req.body)])
    })
}

enum OutMessage {
    Frame(Message),
    /// Drop the socket on the floor, mid-whatever.
    Abort,
}

/// A registered scripted edge serving requests until dropped.
pub struct TestEdge {
    out_tx: mpsc::Sender<OutMessage>,
    pub goodbye_seen: Arc<AtomicBool>,
    pub cancels: Arc<Mutex<Vec<u64>>>,
}

impl TestEdge {
    /// Tear the connection down without any protocol goodbye.
    pub async fn abort(&self) {
        let _ = self.out_tx.send(OutMessage::Abort).await;
    }

    pub async fn send_heartbeat(&self) {
        let _ = self
            .out_tx
            .send(OutMessage::Frame(Message::Text("HEARTBEAT".to_string())))
            .await;
    }
}

/// Connect, register (panicking on rejection) and serve with `handler`.
pub async fn spawn_edge(
    relay: &TestRelay,
    code: &str,
    token: &str,
    edge_handler: EdgeHandler,
) -> TestEdge {
    let subdomain = format!("{code}.example.test");
    let (ws, reply) = raw_register(relay, code, &subdomain, token).await;
    assert_eq!(reply, "OK Registered", "edge registration failed");

    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutMessage>(64);

    // Single writer: every response task funnels frames through here.
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            match message {
                OutMessage::Frame(frame) => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                OutMessage::Abort => {
                    // Close the socket under the relay mid-response.
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    let goodbye_seen = Arc::new(AtomicBool::new(false));
    let cancels = Arc::new(Mutex::new(Vec::new()));

    {
        let out_tx = out_tx.clone();
        let goodbye_seen = Arc::clone(&goodbye_seen);
        let cancels = Arc::clone(&cancels);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Binary(raw)) => {
                        let Ok(frame) = DataFrame::decode(&raw) else {
                            continue;
                        };
                        if frame.kind != DataKind::Request {
                            continue;
                        }
                        let request = EdgeRequest::parse(frame.request_id, &frame.payload);
                        let handler = Arc::clone(&edge_handler);
                        let out_tx = out_tx.clone();
                        tokio::spawn(serve_one(handler, request, out_tx));
                    }
                    Ok(Message::Text(text)) => {
                        if text.starts_with("GOODBYE") {
                            goodbye_seen.store(true, Ordering::SeqCst);
                        } else if let Some(id) = text.strip_prefix("CANCEL ") {
                            if let Ok(id) = id.trim().parse::<u64>() {
                                cancels.lock().await.push(id);
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });
    }

    TestEdge {
        out_tx,
        goodbye_seen,
        cancels,
    }
}

async fn serve_one(
    edge_handler: EdgeHandler,
    request: EdgeRequest,
    out_tx: mpsc::Sender<OutMessage>,
) {
    let request_id = request.request_id;
    let response = edge_handler(request).await;

    if let Some(reason) = &response.error {
        let frame = DataFrame::new(
            request_id,
            DataKind::Error,
            Bytes::copy_from_slice(reason.as_bytes()),
        );
        let _ = out_tx
            .send(OutMessage::Frame(Message::Binary(frame.encode())))
            .await;
        return;
    }

    let head = DataFrame::new(request_id, DataKind::ResponseHead, response.head_bytes());
    if out_tx
        .send(OutMessage::Frame(Message::Binary(head.encode())))
        .await
        .is_err()
    {
        return;
    }

    for (index, chunk) in response.chunks.iter().enumerate() {
        if !response.chunk_delay.is_zero() {
            tokio::time::sleep(response.chunk_delay).await;
        }
        let frame = DataFrame::new(request_id, DataKind::BodyChunk, chunk.clone());
        if out_tx
            .send(OutMessage::Frame(Message::Binary(frame.encode())))
            .await
            .is_err()
        {
            return;
        }
        if response.abort_connection_after == Some(index + 1) {
            let _ = out_tx.send(OutMessage::Abort).await;
            return;
        }
    }

    if response.complete {
        let done = DataFrame::new(request_id, DataKind::Complete, Bytes::new());
        let _ = out_tx
            .send(OutMessage::Frame(Message::Binary(done.encode())))
            .await;
    }
}
