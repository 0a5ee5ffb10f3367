//! Public request routing and request–response correlation.
//!
//! A public request is serialized into a single binary frame (request line,
//! headers, body) and sent down the tunnel tagged with a fresh request id.
//! The response comes back out of band: the session reader pushes the head,
//! body chunks and the terminal marker into this request's bounded channel,
//! and the body is streamed to the client as the frames arrive so multi-
//! megabyte payloads never accumulate in relay memory.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::{HeaderName, HeaderValue};
use http_body_util::{BodyExt, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::RelayBody;
use crate::error::{RelayError, RelayResult};
use crate::lifecycle::RequestGuard;
use crate::tunnel::protocol::{self, DataFrame, DataKind};
use crate::tunnel::{ResponseEvent, Tunnel};

/// Cap on the inline request body. Uploads toward the hospital are small;
/// the big transfers flow the other way.
pub const MAX_INLINE_REQUEST_BODY: usize = 64 * 1024 * 1024;

/// Extract the tunnel id from a public Host header: lowercase, strip the
/// port, strip `.<domain>`. Empty result means apex or foreign host.
pub fn tunnel_id_from_host(host: &str, domain: &str) -> Option<String> {
    let host = host.to_ascii_lowercase();
    let host = host.split(':').next().unwrap_or(&host);

    let suffix = format!(".{}", domain.to_ascii_lowercase());
    let code = host.strip_suffix(&suffix)?;
    if code.is_empty() {
        return None;
    }
    Some(code.to_string())
}

/// Hop-by-hop headers are not forwarded in either direction.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Serialize the inner request for the edge: request line, Host first, the
/// client's headers minus hop-by-hop and framing headers, a recomputed
/// Content-Length, then the body.
pub fn serialize_request(parts: &http::request::Parts, host: &str, body: &[u8]) -> Bytes {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(format!("{} {} HTTP/1.1\r\n", parts.method, path).as_bytes());
    buf.put_slice(format!("Host: {host}\r\n").as_bytes());

    for (name, value) in parts.headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop_header(&lower) || lower == "host" || lower == "content-length" {
            continue;
        }
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if !body.is_empty() {
        buf.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
    buf.freeze()
}

/// A parsed response head from the edge.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// Header pairs in wire order, duplicates preserved.
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

/// Parse the `ResponseHead` frame payload: an HTTP/1.1 status line plus
/// headers, terminated by the usual blank line.
pub fn parse_response_head(raw: &[u8]) -> RelayResult<ResponseHead> {
    let mut header_slots = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_slots);

    match parsed.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(RelayError::Upstream("truncated response head".into()));
        }
        Err(e) => {
            return Err(RelayError::Upstream(format!("malformed response head: {e}")));
        }
    }

    let code = parsed
        .code
        .ok_or_else(|| RelayError::Upstream("response head missing status".into()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| RelayError::Upstream(format!("invalid status code {code}")))?;

    let mut headers = Vec::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        if is_hop_by_hop_header(header.name) {
            continue;
        }
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| RelayError::Upstream(format!("invalid header name {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| RelayError::Upstream("invalid header value".into()))?;
        headers.push((name, value));
    }

    Ok(ResponseHead { status, headers })
}

/// Removes the pending entry when the request ends, however it ends. If the
/// entry was still live (client disconnect, timeout, protocol violation)
/// the edge is told to stop producing with a `CANCEL`.
struct PendingGuard {
    tunnel: Arc<Tunnel>,
    request_id: u64,
    finished: bool,
}

impl PendingGuard {
    fn new(tunnel: Arc<Tunnel>, request_id: u64) -> Self {
        Self {
            tunnel,
            request_id,
            finished: false,
        }
    }

    /// The request reached a terminal frame; the entry is already gone.
    fn finish(&mut self) {
        self.finished = true;
        self.tunnel.close_request(self.request_id);
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.tunnel.close_request(self.request_id);
        if !self.tunnel.is_closing() {
            let tunnel = Arc::clone(&self.tunnel);
            let request_id = self.request_id;
            // Drop may run while the runtime is tearing down; the cancel is
            // best-effort either way.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = tunnel.send_text(protocol::cancel(request_id)).await;
                });
            }
        }
    }
}

/// State threaded through the response body stream.
struct BodyStreamState {
    rx: mpsc::Receiver<ResponseEvent>,
    guard: PendingGuard,
    frame_timeout: Duration,
    /// Keeps the request counted against the drain window while the body
    /// is still streaming.
    _lifecycle: Option<RequestGuard>,
}

/// Forward one public request over the tunnel and stream the response back.
pub async fn dispatch(
    tunnel: Arc<Tunnel>,
    req: Request<Incoming>,
    request_timeout: Duration,
    lifecycle_guard: Option<RequestGuard>,
) -> RelayResult<Response<RelayBody>> {
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| req.uri().host().map(str::to_owned))
        .unwrap_or_default();

    let (parts, body) = req.into_parts();
    let body = Limited::new(body, MAX_INLINE_REQUEST_BODY)
        .collect()
        .await
        .map_err(|e| RelayError::BadRequest(format!("request body: {e}")))?
        .to_bytes();

    let wire_request = serialize_request(&parts, &host, &body);

    let (request_id, mut rx) = tunnel.open_request();
    let mut guard = PendingGuard::new(Arc::clone(&tunnel), request_id);

    debug!(
        hospital = %tunnel.code,
        request_id,
        method = %parts.method,
        path = %parts.uri,
        size = wire_request.len(),
        "forwarding request to agent"
    );

    tunnel
        .send_data(DataFrame::new(request_id, DataKind::Request, wire_request))
        .await?;

    let head = loop {
        match tokio::time::timeout(request_timeout, rx.recv()).await {
            Ok(Some(ResponseEvent::Head(raw))) => break parse_response_head(&raw)?,
            Ok(Some(ResponseEvent::Chunk(_))) => {
                return Err(RelayError::Upstream("body frame before response head".into()));
            }
            Ok(Some(ResponseEvent::Complete)) => {
                guard.finish();
                return Err(RelayError::Upstream("response ended before head".into()));
            }
            Ok(Some(ResponseEvent::Error(reason))) => {
                guard.finish();
                return Err(RelayError::Upstream(reason));
            }
            Ok(None) => {
                guard.finish();
                return Err(RelayError::Transport("tunnel closed".into()));
            }
            Err(_) => {
                warn!(hospital = %tunnel.code, request_id, "timed out waiting for response head");
                return Err(RelayError::Timeout);
            }
        }
    };

    let mut response = Response::builder().status(head.status);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in head.headers {
            headers.append(name, value);
        }
    }

    let state = BodyStreamState {
        rx,
        guard,
        frame_timeout: request_timeout,
        _lifecycle: lifecycle_guard,
    };

    let stream = futures_util::stream::unfold(state, |mut state| async move {
        match tokio::time::timeout(state.frame_timeout, state.rx.recv()).await {
            Ok(Some(ResponseEvent::Chunk(bytes))) => Some((Ok(Frame::data(bytes)), state)),
            Ok(Some(ResponseEvent::Complete)) => {
                state.guard.finish();
                None
            }
            Ok(Some(ResponseEvent::Error(reason))) => {
                state.guard.finish();
                Some((Err(RelayError::Upstream(reason)), state))
            }
            Ok(Some(ResponseEvent::Head(_))) => Some((
                Err(RelayError::Upstream("unexpected second response head".into())),
                state,
            )),
            Ok(None) => {
                state.guard.finish();
                Some((
                    Err(RelayError::Transport("tunnel closed mid-response".into())),
                    state,
                ))
            }
            Err(_) => Some((Err(RelayError::Timeout), state)),
        }
    });

    let body = BodyExt::boxed_unsync(StreamBody::new(stream.boxed()));
    response
        .body(body)
        .map_err(|e| RelayError::Upstream(format!("invalid response head: {e}")))
}
