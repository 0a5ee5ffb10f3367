//! Edge session driver.
//!
//! One task per edge connection. The session starts in Awaiting-Register:
//! the first frame must be a `REGISTER` line, validated through the auth
//! path before the tunnel is inserted into the registry. Once Active, the
//! session runs exactly one reader over the socket (control frames and
//! data frames share it) and dispatches response frames into the pending
//! table by request id. Writes happen elsewhere, behind the tunnel's writer
//! mutex.
//!
//! ```text
//! Awaiting-Register ──valid reg──▶ Active
//! Awaiting-Register ──invalid/timeout──▶ Closed
//! Active ──I/O error / peer close / idle / shutdown──▶ Closing ──▶ Closed
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::RelayState;
use crate::auth;
use crate::tunnel::protocol::{
    self, ControlFrame, DataFrame, DataKind, ProtocolError, parse_control,
};
use crate::tunnel::{EdgeSink, ResponseEvent, Tunnel};

/// How long the relay waits for the `REGISTER` frame before giving up.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for pre-registration error replies.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Drive one edge socket from Awaiting-Register to Closed.
pub async fn run<S>(state: Arc<RelayState>, socket: WebSocketStream<S>, remote_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = socket.split();

    info!(remote = %remote_addr, "new tunnel connection attempt");

    let Some(tunnel) = register(&state, Box::new(sink), &mut stream, remote_addr).await else {
        return;
    };

    info!(
        hospital = %tunnel.code,
        subdomain = %tunnel.subdomain,
        remote = %remote_addr,
        "agent registered"
    );

    run_active(&state, &tunnel, &mut stream).await;

    tunnel.begin_close();
    tunnel.fail_all_pending("tunnel closed");
    state.registry.unregister(&tunnel);
    info!(hospital = %tunnel.code, "agent disconnected");
}

/// Awaiting-Register: read and validate the first frame, insert into the
/// registry, acknowledge. Rejections are replied on the sink before it is
/// dropped; `None` means the session never became Active.
async fn register<R>(
    state: &Arc<RelayState>,
    mut sink: EdgeSink,
    stream: &mut R,
    remote_addr: SocketAddr,
) -> Option<Arc<Tunnel>>
where
    R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let first = match tokio::time::timeout(REGISTRATION_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            warn!(remote = %remote_addr, "first frame was not a text registration");
            reject(&mut sink, "Invalid registration format").await;
            return None;
        }
        Ok(Some(Err(e))) => {
            debug!(remote = %remote_addr, error = %e, "read failed before registration");
            return None;
        }
        Ok(None) => return None,
        Err(_) => {
            warn!(remote = %remote_addr, "registration timed out");
            return None;
        }
    };

    let (code, subdomain, token) = match parse_control(&first) {
        Ok(ControlFrame::Register {
            code,
            subdomain,
            token,
        }) => (code, subdomain, token),
        Ok(_) | Err(_) => {
            warn!(remote = %remote_addr, message = %first.trim(), "invalid registration message");
            reject(&mut sink, "Invalid registration format").await;
            return None;
        }
    };

    let remote_ip = remote_addr.ip();
    if state.auth.is_blocked(remote_ip) {
        warn!(remote = %remote_addr, hospital = %code, "rate limited registration attempt");
        reject(&mut sink, "Too many failed attempts").await;
        return None;
    }

    if let Err(rejection) = auth::authenticate(&state.config, &code, &subdomain, &token) {
        warn!(
            remote = %remote_addr,
            hospital = %code,
            reason = %rejection,
            "registration rejected"
        );
        if rejection.counts_as_failure() {
            state.auth.record_failure(remote_ip);
        }
        reject(&mut sink, rejection.wire_reason()).await;
        return None;
    }

    state.auth.clear(remote_ip);

    if state.lifecycle.is_shutting_down()
        || state.registry.len() >= state.config.max_concurrent_conn
    {
        warn!(
            hospital = %code,
            limit = state.config.max_concurrent_conn,
            "registration rejected: relay at capacity"
        );
        reject(&mut sink, "Relay at capacity").await;
        return None;
    }

    let tunnel = Arc::new(Tunnel::new(
        code,
        subdomain,
        remote_addr,
        sink,
        state.config.request_timeout,
    ));

    if let Err(conflict) = state.registry.register(Arc::clone(&tunnel)) {
        let _ = tunnel
            .send_text(protocol::error_reply(conflict.wire_reason()))
            .await;
        return None;
    }

    if tunnel.send_text(protocol::ok_registered()).await.is_err() {
        state.registry.unregister(&tunnel);
        return None;
    }

    Some(tunnel)
}

/// Active: the single reader. Returns when the session should close.
async fn run_active<R>(state: &Arc<RelayState>, tunnel: &Arc<Tunnel>, stream: &mut R)
where
    R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let idle_timeout = state.config.idle_timeout;
    let mut idle_tick = tokio::time::interval((idle_timeout / 2).max(Duration::from_millis(100)));
    idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    idle_tick.tick().await; // immediate first tick

    let shutdown = state.lifecycle.shutdown_token();
    let closed = tunnel.closed();

    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if handle_control(tunnel, &text).is_err() {
                            warn!(hospital = %tunnel.code, message = %text.trim(), "protocol violation, closing session");
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(raw))) => {
                        if dispatch_data(tunnel, &raw).await.is_err() {
                            warn!(hospital = %tunnel.code, "undecodable data frame, closing session");
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(hospital = %tunnel.code, "agent closed the connection");
                        return;
                    }
                    Some(Err(e)) => {
                        debug!(hospital = %tunnel.code, error = %e, "agent connection error");
                        return;
                    }
                }
            }
            _ = idle_tick.tick() => {
                if tunnel.is_idle(idle_timeout) {
                    info!(
                        hospital = %tunnel.code,
                        idle_secs = idle_timeout.as_secs(),
                        "session idle past threshold, closing"
                    );
                    return;
                }
            }
            _ = closed.cancelled() => return,
            _ = shutdown.cancelled() => {
                let _ = tunnel.send_text(protocol::goodbye("server shutting down")).await;
                return;
            }
        }
    }
}

/// Control frames after registration.
fn handle_control(tunnel: &Arc<Tunnel>, text: &str) -> Result<(), ProtocolError> {
    match parse_control(text)? {
        ControlFrame::Heartbeat => {
            tunnel.touch();
            debug!(hospital = %tunnel.code, "heartbeat received");
            Ok(())
        }
        ControlFrame::Status(report) => {
            debug!(hospital = %tunnel.code, status = %report, "status report");
            Ok(())
        }
        // A second REGISTER on a live session is a violation.
        ControlFrame::Register { .. } => {
            Err(ProtocolError::MalformedControl(text.trim().to_string()))
        }
    }
}

/// Route one binary frame to its pending request. Blocks on a full frame
/// channel: that backpressure is what bounds relay memory for a slow
/// public reader. Frames for unknown request ids (completed, timed out or
/// cancelled requests) are drained and discarded.
async fn dispatch_data(tunnel: &Arc<Tunnel>, raw: &[u8]) -> Result<(), ProtocolError> {
    let frame = DataFrame::decode(raw)?;
    let request_id = frame.request_id;

    let event = match frame.kind {
        DataKind::ResponseHead => ResponseEvent::Head(frame.payload),
        DataKind::BodyChunk => ResponseEvent::Chunk(frame.payload),
        DataKind::Complete => ResponseEvent::Complete,
        DataKind::Error => {
            ResponseEvent::Error(String::from_utf8_lossy(&frame.payload).into_owned())
        }
        DataKind::Request => {
            // Relay-to-edge kind arriving backwards; drop it.
            warn!(hospital = %tunnel.code, request_id, "edge sent a Request frame, ignoring");
            return Ok(());
        }
    };

    let terminal = matches!(event, ResponseEvent::Complete | ResponseEvent::Error(_));

    let Some(sender) = tunnel.pending_sender(request_id) else {
        debug!(hospital = %tunnel.code, request_id, "frame for unknown request, discarding");
        return Ok(());
    };

    if sender.send(event).await.is_err() || terminal {
        tunnel.close_request(request_id);
    }
    Ok(())
}

async fn reject(sink: &mut EdgeSink, reason: &str) {
    let _ = tokio::time::timeout(
        REJECT_WRITE_TIMEOUT,
        sink.send(Message::Text(protocol::error_reply(reason))),
    )
    .await;
}

#[cfg(test)]
pub mod test_support {
    //! In-memory tunnels for unit tests elsewhere in the crate.

    use std::sync::Arc;
    use std::time::Duration;

    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use crate::tunnel::Tunnel;
    use futures_util::StreamExt;

    /// A tunnel whose writer feeds an in-memory peer. The returned client
    /// stream must stay alive for writes to succeed.
    pub async fn loopback_tunnel(
        code: &str,
    ) -> (Arc<Tunnel>, WebSocketStream<tokio::io::DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let (sink, _read_half) = server_ws.split();

        let tunnel = Arc::new(Tunnel::new(
            code.to_string(),
            format!("{code}.example.test"),
            "127.0.0.1:4567".parse().expect("test addr"),
            Box::new(sink),
            Duration::from_secs(5),
        ));
        (tunnel, client_ws)
    }
}
