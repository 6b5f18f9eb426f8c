//! Client <-> server event types for the terminal WebSocket.
//!
//! Frames are JSON text messages tagged by `type`:
//!
//! ```text
//! client -> server   {"type":"input","data":"ls\r"}
//!                    {"type":"command","data":"uptime"}
//!                    {"type":"resize","cols":120,"rows":40}
//! server -> client   {"type":"data","data":"..."}
//!                    {"type":"error","message":"..."}
//!                    {"type":"closed","reason":"..."}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Smallest terminal dimension accepted from a client.
pub const MIN_DIMENSION: u16 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEvent {
    /// Raw keystrokes.
    Input { data: String },
    /// A full command line; a newline is appended before it is written.
    Command { data: String },
    /// Wide integers so out-of-range values are clamped rather than rejected.
    Resize { cols: i64, rows: i64 },
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    Data { data: String },
    Error { message: String },
    Closed { reason: String },
}

impl ServerEvent {
    pub fn data(data: impl Into<String>) -> Self {
        ServerEvent::Data { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        ServerEvent::Closed {
            reason: reason.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing a plain enum of strings cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// A frame handed from the bridge to the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Event(ServerEvent),
    Close(CloseReason),
}

/// A frame handed from the client transport to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    /// Treated as raw input bytes.
    Binary(Bytes),
    Close,
}

/// Why the server closed a terminal stream. Each maps to a WebSocket close
/// code so the browser can tell the cases apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The shell or remote process exited.
    ChannelClosed,
    /// The client went away (echoed back only if the transport is still up).
    ClientClosed,
    /// The session was disconnected through the API or the server is stopping.
    SessionClosed,
    SessionNotFound,
    AlreadyAttached,
    /// The client sent something that is not a valid event.
    MalformedEvent,
    /// Writing to the channel failed.
    ChannelFailed,
    /// A pump crashed.
    InternalError,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::ChannelClosed => 1000,
            CloseReason::ClientClosed => 1000,
            CloseReason::SessionClosed => 1001,
            CloseReason::MalformedEvent => 1003,
            CloseReason::ChannelFailed => 1011,
            CloseReason::InternalError => 1011,
            CloseReason::SessionNotFound => 4404,
            CloseReason::AlreadyAttached => 4409,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::ChannelClosed => "channel closed",
            CloseReason::ClientClosed => "client closed",
            CloseReason::SessionClosed => "session disconnected",
            CloseReason::SessionNotFound => "session not found",
            CloseReason::AlreadyAttached => "already attached",
            CloseReason::MalformedEvent => "malformed event",
            CloseReason::ChannelFailed => "channel write failed",
            CloseReason::InternalError => "internal error",
        }
    }
}

/// Clamp a requested dimension to `[MIN_DIMENSION, max]`.
pub fn clamp_dimension(value: i64, max: u16) -> u16 {
    let max = max.max(MIN_DIMENSION);
    value.clamp(i64::from(MIN_DIMENSION), i64::from(max)) as u16
}

/// Incremental UTF-8 decoder for terminal output.
///
/// PTY reads split multi-byte characters at arbitrary points. Incomplete
/// trailing sequences are held back until the next chunk; genuinely invalid
/// bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // from_utf8 already validated this prefix.
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(tail)
    }
}
