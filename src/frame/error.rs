//! HTTP/2 error codes and frame-layer errors.

use std::fmt;

/// HTTP/2 error codes (RFC 7540 Section 7).
///
/// These are the codes that appear on the wire in RST_STREAM and GOAWAY
/// frames. Whether a given code terminates a stream or the whole connection
/// is decided by the connection layer, not by the code itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown.
    NoError = 0x0,
    /// Structural or ordering violation.
    ProtocolError = 0x1,
    /// Implementation fault.
    InternalError = 0x2,
    /// Flow-control limits exceeded.
    FlowControlError = 0x3,
    /// SETTINGS not acknowledged in time.
    SettingsTimeout = 0x4,
    /// Frame received for a closed stream.
    StreamClosed = 0x5,
    /// Frame size incorrect.
    FrameSizeError = 0x6,
    /// Stream not processed.
    RefusedStream = 0x7,
    /// Stream cancelled.
    Cancel = 0x8,
    /// Header compression state corrupted.
    CompressionError = 0x9,
    /// Connection established in response to a CONNECT request was reset.
    ConnectError = 0xa,
    /// Peer is generating excessive load.
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS properties are inadequate.
    InadequateSecurity = 0xc,
    /// HTTP/1.1 required.
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert a wire value to an error code.
    ///
    /// Unknown values map to `InternalError` per RFC 7540 Section 7.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        };
        f.write_str(name)
    }
}

/// Errors produced while decoding or validating a single frame.
///
/// Each variant carries the wire error code the connection should report.
/// Scope promotion (stream vs connection) happens at the connection layer:
/// an oversized DATA frame on a live stream is a stream error, the same
/// condition on SETTINGS kills the connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    /// Frame length exceeds the advertised SETTINGS_MAX_FRAME_SIZE.
    #[error("frame of {length} octets exceeds maximum {max}")]
    OversizedFrame { length: u32, max: u32 },
    /// A fixed-length frame arrived with the wrong payload length.
    #[error("frame type 0x{frame_type:02x} has malformed length {length}")]
    BadLength { frame_type: u8, length: usize },
    /// Frame type requires a non-zero stream id but arrived on stream 0.
    #[error("frame type 0x{frame_type:02x} not allowed on stream 0")]
    StreamIdRequired { frame_type: u8 },
    /// Frame type is connection-scoped but arrived on a stream.
    #[error("frame type 0x{frame_type:02x} must be sent on stream 0")]
    StreamZeroRequired { frame_type: u8 },
    /// Pad length consumed the whole payload.
    #[error("pad length {pad_length} exceeds payload")]
    BadPadding { pad_length: u8 },
    /// A setting carried a value outside its legal range.
    #[error("setting 0x{id:04x} has invalid value {value}")]
    BadSetting { id: u16, value: u32, code: ErrorCode },
    /// WINDOW_UPDATE with a zero increment.
    #[error("window update increment must be non-zero")]
    ZeroWindowIncrement,
    /// A stream depends on itself.
    #[error("stream {0} cannot depend on itself")]
    SelfDependency(u32),
}

impl FrameError {
    /// The wire error code for this condition.
    pub fn code(&self) -> ErrorCode {
        match self {
            FrameError::OversizedFrame { .. } | FrameError::BadLength { .. } => {
                ErrorCode::FrameSizeError
            }
            FrameError::BadSetting { code, .. } => *code,
            _ => ErrorCode::ProtocolError,
        }
    }
}
