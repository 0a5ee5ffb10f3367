//! Wire protocol for edge sessions.
//!
//! A session is one WebSocket connection. Text frames carry the control
//! plane; binary frames carry request/response bytes tagged with the request
//! they belong to, so any number of public requests can share the session.
//!
//! Text, edge → relay:
//!
//! ```text
//! REGISTER <code> <subdomain> <token>     first frame of the session
//! HEARTBEAT                               liveness, no payload
//! STATUS <free text>                      observational only
//! ```
//!
//! Text, relay → edge: `OK Registered`, `ERROR <reason>`,
//! `GOODBYE <reason>`, `CANCEL <request_id>`.
//!
//! Binary frames start with a 9-byte header: the request id (u64, big
//! endian) and a kind byte, followed by the payload. The relay sends a
//! request as a single `Request` frame (request line + headers + body); the
//! edge answers with one `ResponseHead`, any number of `BodyChunk`s and a
//! terminal `Complete` or `Error`.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Binary header length: u64 request id + kind byte.
pub const DATA_HEADER_LEN: usize = 9;

/// Malformed frames. The session treats any of these as a protocol
/// violation and closes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("binary frame shorter than {DATA_HEADER_LEN} bytes")]
    TruncatedFrame,

    #[error("unknown data frame kind {0}")]
    UnknownKind(u8),

    #[error("malformed control frame {0:?}")]
    MalformedControl(String),
}

/// Kind byte of a binary data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataKind {
    /// Relay → edge: complete serialized request, head and body.
    Request = 0,
    /// Edge → relay: HTTP/1.1 status line and headers.
    ResponseHead = 1,
    /// Edge → relay: one chunk of response body.
    BodyChunk = 2,
    /// Edge → relay: end of response, empty payload.
    Complete = 3,
    /// Edge → relay: the local endpoint failed; payload is a reason.
    Error = 4,
}

impl TryFrom<u8> for DataKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(DataKind::Request),
            1 => Ok(DataKind::ResponseHead),
            2 => Ok(DataKind::BodyChunk),
            3 => Ok(DataKind::Complete),
            4 => Ok(DataKind::Error),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// One binary frame, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub request_id: u64,
    pub kind: DataKind,
    pub payload: Bytes,
}

impl DataFrame {
    pub fn new(request_id: u64, kind: DataKind, payload: Bytes) -> Self {
        Self {
            request_id,
            kind,
            payload,
        }
    }

    /// Serialize into the on-wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + self.payload.len());
        buf.put_u64(self.request_id);
        buf.put_u8(self.kind as u8);
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Decode a binary WebSocket message.
    pub fn decode(raw: &[u8]) -> Result<DataFrame, ProtocolError> {
        if raw.len() < DATA_HEADER_LEN {
            return Err(ProtocolError::TruncatedFrame);
        }
        let request_id = u64::from_be_bytes(raw[..8].try_into().expect("8-byte slice"));
        let kind = DataKind::try_from(raw[8])?;
        Ok(DataFrame {
            request_id,
            kind,
            payload: Bytes::copy_from_slice(&raw[DATA_HEADER_LEN..]),
        })
    }
}

/// Control frames the edge may send as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Register {
        code: String,
        subdomain: String,
        token: String,
    },
    Heartbeat,
    Status(String),
}

/// Parse a text frame from the edge.
pub fn parse_control(text: &str) -> Result<ControlFrame, ProtocolError> {
    let trimmed = text.trim();
    if trimmed == "HEARTBEAT" {
        return Ok(ControlFrame::Heartbeat);
    }
    if let Some(rest) = trimmed.strip_prefix("STATUS ") {
        return Ok(ControlFrame::Status(rest.to_string()));
    }
    if trimmed.starts_with("REGISTER") {
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() != 4 {
            return Err(ProtocolError::MalformedControl(trimmed.to_string()));
        }
        return Ok(ControlFrame::Register {
            code: parts[1].to_string(),
            subdomain: parts[2].to_lowercase(),
            token: parts[3].to_string(),
        });
    }
    Err(ProtocolError::MalformedControl(trimmed.to_string()))
}

/// `OK Registered` reply after a successful registration.
pub fn ok_registered() -> String {
    "OK Registered".to_string()
}

/// `ERROR <reason>` reply on rejection.
pub fn error_reply(reason: &str) -> String {
    format!("ERROR {reason}")
}

/// `GOODBYE <reason>` sent when the relay shuts a session down.
pub fn goodbye(reason: &str) -> String {
    format!("GOODBYE {reason}")
}

/// `CANCEL <request_id>` sent when the public client disappeared.
pub fn cancel(request_id: u64) -> String {
    format!("CANCEL {request_id}")
}
