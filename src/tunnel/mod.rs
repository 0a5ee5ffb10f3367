//! Live tunnel state.
//!
//! A [`Tunnel`] is the in-memory record of one registered edge session. The
//! registry owns it; the session reader and any number of in-flight public
//! requests hold `Arc` references. Writes to the edge are serialized behind
//! a mutex held for one frame emission with a per-message deadline; reads
//! never touch the socket here; the session's single reader dispatches
//! incoming frames into the per-request channels stored in `pending`.

pub mod protocol;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use protocol::DataFrame;

/// The server half of an upgraded edge WebSocket.
pub type EdgeSocket = WebSocketStream<TokioIo<Upgraded>>;

/// Write half of an edge socket. Type-erased so sessions can run over any
/// framed transport (tests use in-memory duplex pairs).
pub type EdgeSink =
    Box<dyn Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin>;

/// Response-side events delivered to a pending public request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// HTTP/1.1 status line and headers as raw bytes.
    Head(Bytes),
    /// One body chunk.
    Chunk(Bytes),
    /// End of response.
    Complete,
    /// The edge reported failure, or the session died underneath us.
    Error(String),
}

/// Bounded frame-queue capacity per pending request. A slow public client
/// fills its queue and stalls the session reader, which throttles the edge
/// through TCP flow control instead of buffering the response in memory.
pub const FRAME_CHANNEL_CAPACITY: usize = 32;

/// One registered edge session.
pub struct Tunnel {
    pub code: String,
    pub subdomain: String,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,

    /// Unix millis of the last heartbeat or registration. Advanced
    /// monotonically, never rewound.
    last_seen_ms: AtomicI64,

    writer: Mutex<EdgeSink>,
    write_timeout: Duration,

    pending: StdMutex<HashMap<u64, mpsc::Sender<ResponseEvent>>>,
    next_request_id: AtomicU64,

    /// Cancelled when the session leaves the Active state.
    closed: CancellationToken,
}

impl Tunnel {
    pub fn new(
        code: String,
        subdomain: String,
        remote_addr: SocketAddr,
        sink: EdgeSink,
        write_timeout: Duration,
    ) -> Self {
        Self {
            code,
            subdomain,
            remote_addr,
            connected_at: Utc::now(),
            last_seen_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            writer: Mutex::new(sink),
            write_timeout,
            pending: StdMutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    /// Token cancelled when the session is closing.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Move the session towards Closed. Idempotent.
    pub fn begin_close(&self) {
        self.closed.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Advance the liveness clock. `last_seen` only moves forward.
    pub fn touch(&self) {
        let now = Utc::now().timestamp_millis();
        self.last_seen_ms.fetch_max(now, Ordering::SeqCst);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }

    /// True once the liveness clock has fallen behind the idle threshold.
    pub fn is_idle(&self, threshold: Duration) -> bool {
        let age_ms = Utc::now().timestamp_millis() - self.last_seen_ms.load(Ordering::SeqCst);
        age_ms > threshold.as_millis() as i64
    }

    /// Send one text control frame, bounded by the write deadline.
    pub async fn send_text(&self, text: String) -> Result<(), RelayError> {
        self.send_message(Message::Text(text)).await
    }

    /// Send one binary data frame, bounded by the write deadline.
    pub async fn send_data(&self, frame: DataFrame) -> Result<(), RelayError> {
        self.send_message(Message::Binary(frame.encode())).await
    }

    async fn send_message(&self, message: Message) -> Result<(), RelayError> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.write_timeout, writer.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.begin_close();
                Err(RelayError::Transport(format!("write failed: {e}")))
            }
            Err(_) => {
                self.begin_close();
                Err(RelayError::Transport("write deadline exceeded".into()))
            }
        }
    }

    /// Allocate a request id and park a pending entry for it. The returned
    /// receiver yields the response events the session reader dispatches.
    pub fn open_request(&self) -> (u64, mpsc::Receiver<ResponseEvent>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(request_id, tx);
        (request_id, rx)
    }

    /// The sender for a pending request, if it is still in flight. Cloned
    /// out so the map lock is never held across an await.
    pub fn pending_sender(&self, request_id: u64) -> Option<mpsc::Sender<ResponseEvent>> {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .get(&request_id)
            .cloned()
    }

    /// Drop a pending entry. Safe to call twice; the loser is a no-op.
    pub fn close_request(&self, request_id: u64) {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .remove(&request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }

    /// Terminate every in-flight request. Each receiver gets a best-effort
    /// error event; dropping the senders then closes the channels, which
    /// the dispatchers observe as a transport failure either way.
    pub fn fail_all_pending(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.try_send(ResponseEvent::Error(reason.to_string()));
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("code", &self.code)
            .field("subdomain", &self.subdomain)
            .field("remote_addr", &self.remote_addr)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}
