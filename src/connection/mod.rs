//! Connection-level state machines.
//!
//! [`ServerConnection`] and [`ClientConnection`] wrap a shared core that
//! owns every per-connection resource: the frame codecs, the HPACK encoder
//! and decoder, the stream map, the priority tree, and the scheduled output
//! queue. The wrappers translate between role-neutral protocol events and
//! the request/response surface the application sees.

mod client;
mod core;
mod server;
mod settings;
mod stream;

pub use client::{ClientConnection, ClientEvent};
pub use server::{ServerConnection, ServerEvent};
pub use settings::{Settings, SettingsState};
pub use stream::{HeadersKind, Stream, StreamState};

use crate::frame::{ErrorCode, StreamId, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_FRAME_SIZE};
use crate::hpack::HeaderField;

/// A protocol violation, scoped per RFC 7540 Section 5.4.
///
/// Stream-scoped errors reset one stream with RST_STREAM; connection-scoped
/// errors emit GOAWAY, drain queued output, and close.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Http2Error {
    #[error("connection error {code}: {reason}")]
    Connection { code: ErrorCode, reason: String },
    #[error("stream {id} error {code}: {reason}")]
    Stream {
        id: StreamId,
        code: ErrorCode,
        reason: String,
    },
}

impl Http2Error {
    pub fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        Http2Error::Connection {
            code,
            reason: reason.into(),
        }
    }

    pub fn stream(id: StreamId, code: ErrorCode, reason: impl Into<String>) -> Self {
        Http2Error::Stream {
            id,
            code,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Http2Error::Connection { code, .. } | Http2Error::Stream { code, .. } => *code,
        }
    }

    pub fn is_connection_level(&self) -> bool {
        matches!(self, Http2Error::Connection { .. })
    }
}

/// Engine configuration. Builder-style setters; the defaults are suitable
/// for a general-purpose server.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Initial capacity of the receive buffer.
    pub read_buffer_size: usize,
    /// WINDOW_UPDATE threshold for request bodies.
    pub request_body_buffer_size: usize,
    /// Initial capacity of per-response header encoding buffers.
    pub response_buffer_size: usize,
    /// Granularity hint for response body chunks.
    pub response_body_buffer_size: usize,
    /// Whether this endpoint will initiate server push.
    pub enable_server_push: bool,
    /// SETTINGS_MAX_CONCURRENT_STREAMS to advertise.
    pub max_concurrent_streams: u32,
    /// SETTINGS_INITIAL_WINDOW_SIZE to advertise.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE to advertise.
    pub max_frame_size: u32,
    /// SETTINGS_HEADER_TABLE_SIZE to advertise.
    pub header_table_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE to advertise, if any.
    pub max_header_list_size: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_buffer_size: 16_384,
            request_body_buffer_size: 4_096,
            response_buffer_size: 1_024,
            response_body_buffer_size: 4_096,
            enable_server_push: true,
            max_concurrent_streams: 0x7FFF_FFFF,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_buffer_size(mut self, value: usize) -> Self {
        self.read_buffer_size = value;
        self
    }

    pub fn request_body_buffer_size(mut self, value: usize) -> Self {
        self.request_body_buffer_size = value;
        self
    }

    pub fn response_buffer_size(mut self, value: usize) -> Self {
        self.response_buffer_size = value;
        self
    }

    pub fn response_body_buffer_size(mut self, value: usize) -> Self {
        self.response_body_buffer_size = value;
        self
    }

    pub fn enable_server_push(mut self, value: bool) -> Self {
        self.enable_server_push = value;
        self
    }

    pub fn max_concurrent_streams(mut self, value: u32) -> Self {
        self.max_concurrent_streams = value;
        self
    }

    pub fn initial_window_size(mut self, value: u32) -> Self {
        self.initial_window_size = value;
        self
    }

    pub fn max_frame_size(mut self, value: u32) -> Self {
        self.max_frame_size = value;
        self
    }

    pub fn header_table_size(mut self, value: u32) -> Self {
        self.header_table_size = value;
        self
    }

    pub fn max_header_list_size(mut self, value: Option<u32>) -> Self {
        self.max_header_list_size = value;
        self
    }

    /// The SETTINGS this configuration advertises.
    pub(crate) fn to_settings(&self, role_can_push: bool) -> Settings {
        Settings {
            header_table_size: self.header_table_size,
            enable_push: role_can_push,
            max_concurrent_streams: self.max_concurrent_streams,
            initial_window_size: self.initial_window_size,
            max_frame_size: self.max_frame_size,
            max_header_list_size: self.max_header_list_size,
        }
    }
}

/// A decoded request line: pseudo-headers plus the regular fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub scheme: String,
    pub path: String,
    pub authority: Option<String>,
    pub fields: Vec<HeaderField>,
}

impl RequestHead {
    pub fn new(method: &str, scheme: &str, path: &str, authority: Option<&str>) -> Self {
        Self {
            method: method.to_string(),
            scheme: scheme.to_string(),
            path: path.to_string(),
            authority: authority.map(str::to_string),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push(HeaderField::new(name, value));
        self
    }

    /// The header list to HPACK-encode: pseudo-headers first.
    pub(crate) fn to_fields(&self) -> Vec<HeaderField> {
        let mut out = Vec::with_capacity(4 + self.fields.len());
        out.push(HeaderField::new(":method", self.method.as_bytes()));
        out.push(HeaderField::new(":scheme", self.scheme.as_bytes()));
        out.push(HeaderField::new(":path", self.path.as_bytes()));
        if let Some(authority) = &self.authority {
            out.push(HeaderField::new(":authority", authority.as_bytes()));
        }
        out.extend(self.fields.iter().cloned());
        out
    }
}

/// A response line: status plus the regular fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub fields: Vec<HeaderField>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push(HeaderField::new(name, value));
        self
    }

    pub(crate) fn to_fields(&self) -> Vec<HeaderField> {
        let mut out = Vec::with_capacity(1 + self.fields.len());
        out.push(HeaderField::new(":status", self.status.to_string()));
        out.extend(self.fields.iter().cloned());
        out
    }
}

/// Read end of a request body; a capability-narrowed view keyed by stream
/// id. Operations go through the owning connection and fail with a
/// STREAM_CLOSED error once the stream is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyReader {
    pub(crate) id: StreamId,
}

impl BodyReader {
    pub fn stream_id(&self) -> StreamId {
        self.id
    }
}

/// Write end of a response (or pushed-response) body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyWriter {
    pub(crate) id: StreamId,
}

impl BodyWriter {
    pub fn stream_id(&self) -> StreamId {
        self.id
    }
}

/// Result of a body read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyRead {
    /// A chunk of body data. Reading releases flow-control credit back to
    /// the peer.
    Chunk(bytes::Bytes),
    /// No data buffered right now; more may arrive.
    Pending,
    /// The peer finished the body.
    Finished,
}

/// Validate a decoded request header list per RFC 7540 Section 8.1.2 and
/// split it into pseudo-headers and regular fields.
///
/// Violations make the request malformed, which is a stream-level protocol
/// error, not a connection error.
pub(crate) fn parse_request_head(fields: Vec<HeaderField>) -> Result<RequestHead, &'static str> {
    let mut method = None;
    let mut scheme = None;
    let mut path = None;
    let mut authority = None;
    let mut regular = Vec::new();
    let mut saw_regular = false;

    for field in fields {
        if field.name.first() == Some(&b':') {
            if saw_regular {
                return Err("pseudo-header after regular field");
            }
            let value = String::from_utf8(field.value).map_err(|_| "pseudo-header not UTF-8")?;
            let slot = match field.name.as_slice() {
                b":method" => &mut method,
                b":scheme" => &mut scheme,
                b":path" => &mut path,
                b":authority" => &mut authority,
                _ => return Err("unknown pseudo-header in request"),
            };
            if slot.is_some() {
                return Err("duplicate pseudo-header");
            }
            *slot = Some(value);
        } else {
            saw_regular = true;
            if field.name.iter().any(u8::is_ascii_uppercase) {
                return Err("header name not lowercase");
            }
            match field.name.as_slice() {
                // Connection-specific headers do not exist in HTTP/2.
                b"connection" | b"keep-alive" | b"proxy-connection" | b"transfer-encoding"
                | b"upgrade" => return Err("connection-specific header"),
                b"te" if field.value != b"trailers" => return Err("te must be trailers"),
                _ => regular.push(field),
            }
        }
    }

    let method = method.ok_or("missing :method")?;
    let scheme = scheme.ok_or("missing :scheme")?;
    let path = path.ok_or("missing :path")?;
    if path.is_empty() {
        return Err("empty :path");
    }

    Ok(RequestHead {
        method,
        scheme,
        path,
        authority,
        fields: regular,
    })
}

/// Validate a decoded response header list and extract the status.
pub(crate) fn parse_response_head(fields: Vec<HeaderField>) -> Result<ResponseHead, &'static str> {
    let mut status = None;
    let mut regular = Vec::new();
    let mut saw_regular = false;

    for field in fields {
        if field.name.first() == Some(&b':') {
            if saw_regular {
                return Err("pseudo-header after regular field");
            }
            if field.name.as_slice() != b":status" {
                return Err("unknown pseudo-header in response");
            }
            if status.is_some() {
                return Err("duplicate :status");
            }
            let text = std::str::from_utf8(&field.value).map_err(|_| ":status not UTF-8")?;
            status = Some(text.parse::<u16>().map_err(|_| ":status not numeric")?);
        } else {
            saw_regular = true;
            regular.push(field);
        }
    }

    Ok(ResponseHead {
        status: status.ok_or("missing :status")?,
        fields: regular,
    })
}
