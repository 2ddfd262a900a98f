//! ==============================================================================
//! protocol.rs - text wire format shared by hub and spoke
//! ==============================================================================
//!
//! purpose:
//!     encodes sensor readings into the fixed-format text message, decodes
//!     them back on the hub, and frames the byte stream into messages.
//!
//! wire format:
//!     greeting  hub -> spoke   "Welcome to the demonstration TCP socket server. ..."
//!     message   spoke -> hub   "<label:8> - <value>:<epoch>END"
//!     ack       hub -> spoke   "OK..." + verbatim message
//!
//! relationships:
//!     - used by: server.rs (framing, ack, decode)
//!     - used by: client.rs (encode, greeting + ack checks)
//!
//! ==============================================================================

use thiserror::Error;

/// sent once by the hub on every new connection
pub const GREETING: &str =
    "Welcome to the demonstration TCP socket server. Type something and hit enter\n";

/// the part of the greeting a spoke must see before it sends anything
pub const GREETING_MARKER: &str = "Welcome to the demonstration TCP socket server";

/// prefix of every acknowledgement; spokes compare the first 5 bytes
pub const ACK_PREFIX: &str = "OK...";

/// message terminator
pub const TERMINATOR: &str = "END";

/// separator between label and value
const LABEL_SEPARATOR: &str = " - ";

/// fixed width of the source label
pub const LABEL_LEN: usize = 8;

/// readings at least this old (seconds) are replaced by [`STALE_SENTINEL`]
pub const FRESHNESS_WINDOW_SECS: i64 = 300;

pub const STALE_SENTINEL: &str = "*too old!*";

/// default TCP port shared by hub and spokes
pub const DEFAULT_PORT: u16 = 8888;

/// bytes requested per socket read on the hub
pub const READ_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("label {0:?} must be exactly 8 ascii characters")]
    BadLabel(String),

    #[error("value {0:?} contains a reserved delimiter")]
    ReservedDelimiter(String),

    #[error("value {0:?} has leading or trailing whitespace")]
    PaddedValue(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message shorter than a label")]
    TooShort,

    #[error("unrecognized label {0:?}")]
    UnrecognizedLabel(String),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("bad epoch timestamp {0:?}")]
    BadEpoch(String),
}

/// a single sensor data point, immutable once formatted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    label: String,
    value: String,
    epoch: i64,
}

impl Reading {
    pub fn new(
        label: impl Into<String>,
        value: impl Into<String>,
        epoch: i64,
    ) -> Result<Self, EncodeError> {
        let label = label.into();
        let value = value.into();

        if label.len() != LABEL_LEN || !label.is_ascii() || label.contains(TERMINATOR) {
            return Err(EncodeError::BadLabel(label));
        }
        if value.contains(':') || value.contains(TERMINATOR) || value.contains('\n') {
            return Err(EncodeError::ReservedDelimiter(value));
        }
        // decode trims the value, so padding would not survive the wire
        if value.trim() != value {
            return Err(EncodeError::PaddedValue(value));
        }

        Ok(Self { label, value, epoch })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    /// wire form: `<label> - <value>:<epoch>END`
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}:{}{}",
            self.label, LABEL_SEPARATOR, self.value, self.epoch, TERMINATOR
        )
    }
}

/// split a received message into label, value and sent epoch.
///
/// the label is the first 8 bytes and must be in `known`. the value runs
/// from after `" - "` up to the last `':'` before `END`, trimmed.
pub fn decode<S: AsRef<str>>(message: &str, known: &[S]) -> Result<Reading, DecodeError> {
    let message = message.trim_start();
    let label = message.get(..LABEL_LEN).ok_or(DecodeError::TooShort)?;

    if !known.iter().any(|k| k.as_ref() == label) {
        return Err(DecodeError::UnrecognizedLabel(label.to_string()));
    }

    let rest = &message[LABEL_LEN..];
    let body = rest
        .trim_start()
        .strip_prefix('-')
        .ok_or(DecodeError::Malformed("missing ' - ' after label"))?;

    let end = body
        .find(TERMINATOR)
        .ok_or(DecodeError::Malformed("missing END terminator"))?;
    let body = &body[..end];

    let colon = body
        .rfind(':')
        .ok_or(DecodeError::Malformed("missing ':' before epoch"))?;
    let value = body[..colon].trim();
    let epoch_text = body[colon + 1..].trim();
    let epoch = epoch_text
        .parse::<i64>()
        .map_err(|_| DecodeError::BadEpoch(epoch_text.to_string()))?;

    Ok(Reading {
        label: label.to_string(),
        value: value.to_string(),
        epoch,
    })
}

/// acknowledgement for a received message, echoing its bytes unchanged
pub fn ack(message: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(ACK_PREFIX.len() + message.len());
    reply.extend_from_slice(ACK_PREFIX.as_bytes());
    reply.extend_from_slice(message);
    reply
}

/// true when the reply starts with the ack prefix
pub fn is_ack(reply: &[u8]) -> bool {
    reply.len() >= ACK_PREFIX.len() && &reply[..ACK_PREFIX.len()] == ACK_PREFIX.as_bytes()
}

/// seconds since the unix epoch
pub fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ==============================================================================
// framing
// ==============================================================================
// tcp gives no message boundaries, so the hub accumulates bytes and cuts a
// message at each END terminator, or at a newline for people typing into
// telnet. if the buffered text reaches `limit` with no terminator it is
// flushed as one message, which matches "one read, one message" for peers
// that never send END.

#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    limit: usize,
}

impl Framer {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(limit),
            limit,
        }
    }

    /// feed bytes from one read, returning every message completed by them.
    /// frames are raw bytes; non-utf8 input is kept as sent.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(cut) = self.next_cut() {
            let frame: Vec<u8> = self.buffer.drain(..cut).collect();
            Self::emit(&mut frames, frame);
        }

        if self.buffer.len() >= self.limit {
            let frame = std::mem::take(&mut self.buffer);
            Self::emit(&mut frames, frame);
        }

        frames
    }

    /// bytes still waiting for a terminator
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    fn emit(frames: &mut Vec<Vec<u8>>, frame: Vec<u8>) {
        if !frame.iter().all(u8::is_ascii_whitespace) {
            frames.push(frame);
        }
    }

    fn next_cut(&self) -> Option<usize> {
        let end = self
            .buffer
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR.as_bytes())
            .map(|i| i + TERMINATOR.len());
        let newline = self.buffer.iter().position(|&b| b == b'\n').map(|i| i + 1);
        match (end, newline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
