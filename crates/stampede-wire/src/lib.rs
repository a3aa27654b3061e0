// STOMP frame model: commands, ordered headers, value escaping.
use bytes::Bytes;

pub mod codec;

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("unexpected end of stream inside a frame")]
    Incomplete,
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    #[error("invalid escape sequence in header")]
    InvalidEscape,
    #[error("malformed header line")]
    BadHeader,
    #[error("invalid content-length value")]
    BadContentLength,
    #[error("missing NUL frame terminator")]
    MissingTerminator,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// Frame commands. STOMP commands are case sensitive.
pub mod command {
    // client frames
    pub const CONNECT: &str = "CONNECT";
    pub const STOMP: &str = "STOMP";
    pub const SEND: &str = "SEND";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    pub const ACK: &str = "ACK";
    pub const NACK: &str = "NACK";
    pub const BEGIN: &str = "BEGIN";
    pub const COMMIT: &str = "COMMIT";
    pub const ABORT: &str = "ABORT";
    pub const DISCONNECT: &str = "DISCONNECT";

    // server frames
    pub const CONNECTED: &str = "CONNECTED";
    pub const MESSAGE: &str = "MESSAGE";
    pub const RECEIPT: &str = "RECEIPT";
    pub const ERROR: &str = "ERROR";
}

// Header names. STOMP header names are case sensitive.
pub mod header {
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const RECEIPT: &str = "receipt";
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const HOST: &str = "host";
    pub const VERSION: &str = "version";
    pub const LOGIN: &str = "login";
    pub const PASSCODE: &str = "passcode";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const SESSION: &str = "session";
    pub const SERVER: &str = "server";
    pub const DESTINATION: &str = "destination";
    pub const ID: &str = "id";
    pub const ACK: &str = "ack";
    pub const TRANSACTION: &str = "transaction";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const MESSAGE_ID: &str = "message-id";
    pub const MESSAGE: &str = "message";
}

/// Protocol versions the broker speaks, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    V1_0,
    V1_1,
    V1_2,
}

impl Version {
    pub const SUPPORTED: [Version; 3] = [Version::V1_0, Version::V1_1, Version::V1_2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V1_0 => "1.0",
            Version::V1_1 => "1.1",
            Version::V1_2 => "1.2",
        }
    }

    pub fn parse(value: &str) -> Option<Version> {
        match value.trim() {
            "1.0" => Some(Version::V1_0),
            "1.1" => Some(Version::V1_1),
            "1.2" => Some(Version::V1_2),
            _ => None,
        }
    }

    // Header escaping applies from 1.1 on; 1.0 passes octets through.
    pub fn escapes_headers(&self) -> bool {
        *self >= Version::V1_1
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escape a header name or value for the wire (version >= 1.1).
///
/// `\r`, `\n`, `:` and `\` become `\r`, `\n`, `\c` and `\\`.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`escape_value`]. Any escape sequence outside the four defined
/// by the protocol is an error.
pub fn unescape_value(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => return Err(WireError::InvalidEscape),
        }
    }
    Ok(out)
}

/// A single STOMP header, stored in decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header sequence.
///
/// This is a list and not a map: the protocol allows repeated header names,
/// and on repeats the first occurrence carries the value while the rest are
/// historical. Lookups therefore return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|h| h.name == name)
    }

    /// Append a header, keeping any existing occurrences.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replace the value of the first occurrence, or append when absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        match self.0.iter_mut().find(|h| h.name == name) {
            Some(h) => h.value = value.into(),
            None => self.push(name, value),
        }
    }

    /// Drop every occurrence of `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| h.name != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single STOMP frame.
///
/// ```
/// use stampede_wire::{Frame, command, header};
///
/// let mut frame = Frame::new(command::SEND);
/// frame.headers.push(header::DESTINATION, "/queue/orders");
/// assert_eq!(frame.headers.get(header::DESTINATION), Some("/queue/orders"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Headers,
    // Only SEND, MESSAGE and ERROR frames carry a body.
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(command: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn destination(&self) -> Option<&str> {
        self.headers.get(header::DESTINATION)
    }

    pub fn receipt(&self) -> Option<&str> {
        self.headers.get(header::RECEIPT)
    }

    /// Server ERROR frame with a summary `message` header and the detail as
    /// body.
    pub fn error(message: &str) -> Frame {
        let mut frame = Frame::with_body(command::ERROR, Bytes::copy_from_slice(message.as_bytes()));
        frame
            .headers
            .push(header::MESSAGE, message.to_string());
        frame
    }

    /// Server RECEIPT frame answering `receipt_id`.
    pub fn receipt_for(receipt_id: &str) -> Frame {
        let mut frame = Frame::new(command::RECEIPT);
        frame.headers.push(header::RECEIPT_ID, receipt_id);
        frame
    }
}
