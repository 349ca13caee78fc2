//! Wire messages and newline-delimited JSON framing.
//!
//! Every message is a single JSON object terminated by `\n`. Inbound bytes are
//! buffered per connection by [`LineFramer`], so a message split across reads
//! or several messages arriving in one read decode the same way.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AttendanceError, Result};

const KNOWN_ACTIONS: [&str; 3] = ["login", "start_timer", "stop_timer"];

/// Client to server messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Login {
        username: String,
        /// Validated into a [`super::Role`] by the session
        role: String,
    },

    StartTimer {
        username: String,
    },

    StopTimer {
        username: String,
    },
}

/// Server to client messages, pushed whenever presence state changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerMessage {
    UpdateAttendance {
        /// Students marked present
        data: Vec<String>,
        /// Students with a running timer
        #[serde(default)]
        active: Vec<String>,
    },
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Well-formed object whose action this server does not handle
    Unknown(String),
}

impl Inbound {
    pub fn parse(frame: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| AttendanceError::protocol(format!("malformed JSON: {}", e)))?;

        match value.get("action").and_then(Value::as_str) {
            None => return Err(AttendanceError::protocol("missing action field")),
            Some(action) if !KNOWN_ACTIONS.contains(&action) => {
                return Ok(Inbound::Unknown(action.to_string()));
            }
            Some(_) => {}
        }

        serde_json::from_value(value)
            .map(Inbound::Message)
            .map_err(|e| AttendanceError::protocol(e.to_string()))
    }
}

impl ClientMessage {
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::Login { .. } => "login",
            ClientMessage::StartTimer { .. } => "start_timer",
            ClientMessage::StopTimer { .. } => "stop_timer",
        }
    }
}

/// Serializes a message as one newline-terminated frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String> {
    let mut frame = serde_json::to_string(message)?;
    frame.push('\n');
    Ok(frame)
}

/// Incremental splitter for newline-delimited frames
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl LineFramer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame, skipping blank lines.
    ///
    /// Fails once a frame (complete or still buffering) exceeds the limit.
    pub fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > self.max_frame_bytes {
                    return Err(AttendanceError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                return Ok(None);
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if let Some(frame) = self.decode_line(line)? {
                return Ok(Some(frame));
            }
        }
    }

    /// Drains an unterminated trailing frame once the peer has closed its side
    pub fn finish(&mut self) -> Result<Option<String>> {
        let line = std::mem::take(&mut self.buf);
        self.decode_line(line)
    }

    fn decode_line(&self, line: Vec<u8>) -> Result<Option<String>> {
        if line.len() > self.max_frame_bytes {
            return Err(AttendanceError::FrameTooLarge {
                limit: self.max_frame_bytes,
            });
        }

        let text = String::from_utf8(line)
            .map_err(|_| AttendanceError::protocol("frame is not valid UTF-8"))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }
}
