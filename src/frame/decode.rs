//! Binary frame parsing.

use bytes::{Buf, Bytes, BytesMut};

use super::error::{ErrorCode, FrameError};
use super::types::*;
use super::{flags, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};

/// Parses HTTP/2 frames out of a contiguous receive buffer.
///
/// The decoder is stateless apart from the frame-size limit; partial input
/// stays in the caller's buffer until a complete frame is available.
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Update the limit after a local SETTINGS_MAX_FRAME_SIZE is acknowledged.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Whether the buffer holds at least one complete frame.
    pub fn has_complete_frame(&self, buf: &[u8]) -> bool {
        if buf.len() < FRAME_HEADER_SIZE {
            return false;
        }
        let header = FrameHeader::parse(buf);
        buf.len() >= FRAME_HEADER_SIZE + header.length as usize
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more input is needed. On success the frame's
    /// bytes are consumed from the buffer; on error the buffer is left
    /// untouched so the connection can report the offending header.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::parse(buf);

        if header.length > self.max_frame_size {
            return Err(FrameError::OversizedFrame {
                length: header.length,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize).freeze();

        self.assemble(header, payload).map(Some)
    }

    fn assemble(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        match FrameType::from_u8(header.frame_type) {
            Some(FrameType::Data) => decode_data(header, payload),
            Some(FrameType::Headers) => decode_headers(header, payload),
            Some(FrameType::Priority) => decode_priority(header, payload),
            Some(FrameType::RstStream) => decode_rst_stream(header, payload),
            Some(FrameType::Settings) => decode_settings(header, payload),
            Some(FrameType::PushPromise) => decode_push_promise(header, payload),
            Some(FrameType::Ping) => decode_ping(header, payload),
            Some(FrameType::GoAway) => decode_goaway(header, payload),
            Some(FrameType::WindowUpdate) => decode_window_update(header, payload),
            Some(FrameType::Continuation) => decode_continuation(header, payload),
            None => Ok(Frame::Unknown(UnknownFrame {
                frame_type: header.frame_type,
                flags: header.flags,
                stream_id: header.stream_id,
                payload,
            })),
        }
    }
}

fn require_stream(header: &FrameHeader) -> Result<(), FrameError> {
    if header.stream_id.is_connection() {
        return Err(FrameError::StreamIdRequired {
            frame_type: header.frame_type,
        });
    }
    Ok(())
}

fn require_connection(header: &FrameHeader) -> Result<(), FrameError> {
    if !header.stream_id.is_connection() {
        return Err(FrameError::StreamZeroRequired {
            frame_type: header.frame_type,
        });
    }
    Ok(())
}

/// Strip the pad-length octet and trailing pad. Returns the data and the
/// number of octets removed (which still count against flow control).
fn strip_padding(mut payload: Bytes) -> Result<(Bytes, u32), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::BadPadding { pad_length: 0 });
    }
    let pad_length = payload.get_u8() as usize;
    // RFC 7540 Section 6.1: padding that is >= the frame payload is fatal.
    if pad_length > payload.len() {
        return Err(FrameError::BadPadding {
            pad_length: pad_length as u8,
        });
    }
    let data = payload.slice(..payload.len() - pad_length);
    Ok((data, pad_length as u32 + 1))
}

fn read_priority_spec(payload: &mut Bytes, on: StreamId) -> Result<PrioritySpec, FrameError> {
    let word = payload.get_u32();
    let dependency = StreamId::new(word & 0x7FFF_FFFF);
    if dependency == on {
        return Err(FrameError::SelfDependency(on.value()));
    }
    Ok(PrioritySpec {
        exclusive: word & 0x8000_0000 != 0,
        dependency,
        weight: u16::from(payload.get_u8()) + 1,
    })
}

fn decode_data(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    require_stream(&header)?;

    let (data, padding) = if header.has_flag(flags::PADDED) {
        strip_padding(payload)?
    } else {
        (payload, 0)
    };

    Ok(Frame::Data(DataFrame {
        stream_id: header.stream_id,
        end_stream: header.has_flag(flags::END_STREAM),
        data,
        padding,
    }))
}

fn decode_headers(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    require_stream(&header)?;

    let (mut fragment, _padding) = if header.has_flag(flags::PADDED) {
        strip_padding(payload)?
    } else {
        (payload, 0)
    };

    let priority = if header.has_flag(flags::PRIORITY) {
        if fragment.len() < 5 {
            return Err(FrameError::BadLength {
                frame_type: header.frame_type,
                length: fragment.len(),
            });
        }
        Some(read_priority_spec(&mut fragment, header.stream_id)?)
    } else {
        None
    };

    Ok(Frame::Headers(HeadersFrame {
        stream_id: header.stream_id,
        end_stream: header.has_flag(flags::END_STREAM),
        end_headers: header.has_flag(flags::END_HEADERS),
        priority,
        fragment,
    }))
}

fn decode_priority(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    require_stream(&header)?;
    if payload.len() != 5 {
        return Err(FrameError::BadLength {
            frame_type: header.frame_type,
            length: payload.len(),
        });
    }
    let priority = read_priority_spec(&mut payload, header.stream_id)?;
    Ok(Frame::Priority(PriorityFrame {
        stream_id: header.stream_id,
        priority,
    }))
}

fn decode_rst_stream(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    require_stream(&header)?;
    if payload.len() != 4 {
        return Err(FrameError::BadLength {
            frame_type: header.frame_type,
            length: payload.len(),
        });
    }
    Ok(Frame::RstStream(RstStreamFrame {
        stream_id: header.stream_id,
        error_code: payload.get_u32(),
    }))
}

fn decode_settings(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    require_connection(&header)?;

    let ack = header.has_flag(flags::ACK);
    if ack && !payload.is_empty() {
        return Err(FrameError::BadLength {
            frame_type: header.frame_type,
            length: payload.len(),
        });
    }
    if payload.len() % 6 != 0 {
        return Err(FrameError::BadLength {
            frame_type: header.frame_type,
            length: payload.len(),
        });
    }

    let mut settings = Vec::with_capacity(payload.len() / 6);
    while payload.has_remaining() {
        let id = SettingId::from_u16(payload.get_u16());
        let value = payload.get_u32();
        validate_setting(id, value)?;
        settings.push(Setting { id, value });
    }

    Ok(Frame::Settings(SettingsFrame { ack, settings }))
}

/// Range checks from RFC 7540 Section 6.5.2. Each violation names the error
/// code the connection must report.
fn validate_setting(id: SettingId, value: u32) -> Result<(), FrameError> {
    let code = match id {
        SettingId::EnablePush if value > 1 => ErrorCode::ProtocolError,
        SettingId::InitialWindowSize if value > 0x7FFF_FFFF => ErrorCode::FlowControlError,
        SettingId::MaxFrameSize if !(16_384..=16_777_215).contains(&value) => {
            ErrorCode::ProtocolError
        }
        _ => return Ok(()),
    };
    Err(FrameError::BadSetting {
        id: id.to_u16(),
        value,
        code,
    })
}

fn decode_push_promise(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    require_stream(&header)?;

    let (mut fragment, _padding) = if header.has_flag(flags::PADDED) {
        strip_padding(payload)?
    } else {
        (payload, 0)
    };

    if fragment.len() < 4 {
        return Err(FrameError::BadLength {
            frame_type: header.frame_type,
            length: fragment.len(),
        });
    }
    let promised_stream_id = StreamId::new(fragment.get_u32());

    Ok(Frame::PushPromise(PushPromiseFrame {
        stream_id: header.stream_id,
        end_headers: header.has_flag(flags::END_HEADERS),
        promised_stream_id,
        fragment,
    }))
}

fn decode_ping(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    require_connection(&header)?;
    if payload.len() != 8 {
        return Err(FrameError::BadLength {
            frame_type: header.frame_type,
            length: payload.len(),
        });
    }
    let mut opaque = [0u8; 8];
    opaque.copy_from_slice(&payload);
    Ok(Frame::Ping(PingFrame {
        ack: header.has_flag(flags::ACK),
        payload: opaque,
    }))
}

fn decode_goaway(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    require_connection(&header)?;
    if payload.len() < 8 {
        return Err(FrameError::BadLength {
            frame_type: header.frame_type,
            length: payload.len(),
        });
    }
    let last_stream_id = StreamId::new(payload.get_u32());
    let error_code = payload.get_u32();
    Ok(Frame::GoAway(GoAwayFrame {
        last_stream_id,
        error_code,
        debug_data: payload,
    }))
}

fn decode_window_update(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if payload.len() != 4 {
        return Err(FrameError::BadLength {
            frame_type: header.frame_type,
            length: payload.len(),
        });
    }
    let increment = payload.get_u32() & 0x7FFF_FFFF;
    if increment == 0 {
        return Err(FrameError::ZeroWindowIncrement);
    }
    Ok(Frame::WindowUpdate(WindowUpdateFrame {
        stream_id: header.stream_id,
        increment,
    }))
}

fn decode_continuation(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    require_stream(&header)?;
    Ok(Frame::Continuation(ContinuationFrame {
        stream_id: header.stream_id,
        end_headers: header.has_flag(flags::END_HEADERS),
        fragment: payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(raw: &[u8]) -> Result<Option<Frame>, FrameError> {
        let mut buf = BytesMut::from(raw);
        FrameDecoder::new().decode(&mut buf)
    }

    #[test]
    fn needs_more_data() {
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert!(FrameDecoder::new().decode(&mut buf).unwrap().is_none());
        // Header present but payload truncated.
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x08, 0x06, 0x00, 0, 0, 0, 0, 1, 2][..]);
        assert!(FrameDecoder::new().decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 11); // untouched
    }

    #[test]
    fn oversized_frame_rejected_before_payload() {
        // Length 20480 with default 16384 limit; no payload needed to fail.
        let raw = [0x00, 0x50, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        let err = decode_one(&raw).unwrap_err();
        assert!(matches!(err, FrameError::OversizedFrame { length: 20480, .. }));
        assert_eq!(err.code(), ErrorCode::FrameSizeError);
    }

    #[test]
    fn raised_limit_accepts_larger_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.set_max_frame_size(32_768);
        let mut raw = vec![0x00, 0x50, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        raw.extend_from_slice(&vec![0u8; 20480]);
        let mut buf = BytesMut::from(&raw[..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::Data(_)));
    }

    #[test]
    fn data_with_padding() {
        // Payload: pad-length 3, "hi", 3 pad octets.
        let raw = [
            0x00, 0x00, 0x06, 0x00, 0x09, 0x00, 0x00, 0x00, 0x01, //
            0x03, b'h', b'i', 0x00, 0x00, 0x00,
        ];
        let frame = decode_one(&raw).unwrap().unwrap();
        match frame {
            Frame::Data(f) => {
                assert_eq!(f.data.as_ref(), b"hi");
                assert!(f.end_stream);
                assert_eq!(f.padding, 4);
            }
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn data_padding_consuming_payload_is_rejected() {
        let raw = [
            0x00, 0x00, 0x03, 0x00, 0x08, 0x00, 0x00, 0x00, 0x01, //
            0x05, 0x00, 0x00,
        ];
        let err = decode_one(&raw).unwrap_err();
        assert!(matches!(err, FrameError::BadPadding { pad_length: 5 }));
    }

    #[test]
    fn data_on_stream_zero_is_rejected() {
        let raw = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xaa];
        let err = decode_one(&raw).unwrap_err();
        assert!(matches!(err, FrameError::StreamIdRequired { frame_type: 0 }));
    }

    #[test]
    fn headers_with_priority_prefix() {
        let raw = [
            0x00, 0x00, 0x06, 0x01, 0x24, 0x00, 0x00, 0x00, 0x03, //
            0x80, 0x00, 0x00, 0x01, 0x0f, // exclusive on stream 1, weight 16
            0x82,
        ];
        let frame = decode_one(&raw).unwrap().unwrap();
        match frame {
            Frame::Headers(f) => {
                let p = f.priority.unwrap();
                assert!(p.exclusive);
                assert_eq!(p.dependency.value(), 1);
                assert_eq!(p.weight, 16);
                assert_eq!(f.fragment.as_ref(), &[0x82]);
                assert!(f.end_headers);
                assert!(!f.end_stream);
            }
            other => panic!("expected HEADERS, got {other:?}"),
        }
    }

    #[test]
    fn headers_self_dependency_is_rejected() {
        let raw = [
            0x00, 0x00, 0x05, 0x02, 0x00, 0x00, 0x00, 0x00, 0x03, //
            0x00, 0x00, 0x00, 0x03, 0x0f,
        ];
        let err = decode_one(&raw).unwrap_err();
        assert!(matches!(err, FrameError::SelfDependency(3)));
    }

    #[test]
    fn settings_payload_must_be_multiple_of_six() {
        let raw = [
            0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x00, 0x01, 0x00, 0x00, 0x20,
        ];
        let err = decode_one(&raw).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FrameSizeError);
    }

    #[test]
    fn settings_ack_with_payload_is_rejected() {
        let raw = [
            0x00, 0x00, 0x06, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, //
            0x00, 0x01, 0x00, 0x00, 0x20, 0x00,
        ];
        assert!(decode_one(&raw).is_err());
    }

    #[test]
    fn settings_enable_push_range() {
        let raw = [
            0x00, 0x00, 0x06, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x00, 0x02, 0x00, 0x00, 0x00, 0x02,
        ];
        let err = decode_one(&raw).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn settings_initial_window_range() {
        let raw = [
            0x00, 0x00, 0x06, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x00, 0x04, 0x80, 0x00, 0x00, 0x00,
        ];
        let err = decode_one(&raw).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FlowControlError);
    }

    #[test]
    fn settings_unknown_id_is_carried() {
        let raw = [
            0x00, 0x00, 0x06, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x00, 0x99, 0x00, 0x00, 0x00, 0x07,
        ];
        let frame = decode_one(&raw).unwrap().unwrap();
        match frame {
            Frame::Settings(f) => {
                assert_eq!(f.settings[0].id, SettingId::Unknown(0x99));
                assert_eq!(f.settings[0].value, 7);
            }
            other => panic!("expected SETTINGS, got {other:?}"),
        }
    }

    #[test]
    fn ping_requires_eight_octets() {
        let raw = [0x00, 0x00, 0x04, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 1, 2, 3, 4];
        let err = decode_one(&raw).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FrameSizeError);
    }

    #[test]
    fn ping_on_stream_is_rejected() {
        let raw = [
            0x00, 0x00, 0x08, 0x06, 0x00, 0x00, 0x00, 0x00, 0x01, //
            1, 2, 3, 4, 5, 6, 7, 8,
        ];
        let err = decode_one(&raw).unwrap_err();
        assert!(matches!(err, FrameError::StreamZeroRequired { frame_type: 6 }));
    }

    #[test]
    fn goaway_with_debug_data() {
        let raw = [
            0x00, 0x00, 0x0b, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x01, b'b', b'y', b'e',
        ];
        let frame = decode_one(&raw).unwrap().unwrap();
        match frame {
            Frame::GoAway(f) => {
                assert_eq!(f.last_stream_id.value(), 5);
                assert_eq!(f.error_code, 1);
                assert_eq!(f.debug_data.as_ref(), b"bye");
            }
            other => panic!("expected GOAWAY, got {other:?}"),
        }
    }

    #[test]
    fn window_update_zero_increment_is_rejected() {
        let raw = [
            0x00, 0x00, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00, 0x01, //
            0x00, 0x00, 0x00, 0x00,
        ];
        let err = decode_one(&raw).unwrap_err();
        assert!(matches!(err, FrameError::ZeroWindowIncrement));
    }

    #[test]
    fn window_update_reserved_bit_ignored() {
        let raw = [
            0x00, 0x00, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x80, 0x00, 0x01, 0x00,
        ];
        let frame = decode_one(&raw).unwrap().unwrap();
        match frame {
            Frame::WindowUpdate(f) => assert_eq!(f.increment, 256),
            other => panic!("expected WINDOW_UPDATE, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_is_surfaced_not_rejected() {
        let raw = [
            0x00, 0x00, 0x03, 0xbe, 0x07, 0x00, 0x00, 0x00, 0x09, //
            0x01, 0x02, 0x03,
        ];
        let frame = decode_one(&raw).unwrap().unwrap();
        match frame {
            Frame::Unknown(f) => {
                assert_eq!(f.frame_type, 0xbe);
                assert_eq!(f.flags, 0x07);
                assert_eq!(f.stream_id.value(), 9);
                assert_eq!(f.payload.as_ref(), &[1, 2, 3]);
            }
            other => panic!("expected unknown frame, got {other:?}"),
        }
    }

    #[test]
    fn push_promise_carries_promised_id() {
        let raw = [
            0x00, 0x00, 0x05, 0x05, 0x04, 0x00, 0x00, 0x00, 0x01, //
            0x00, 0x00, 0x00, 0x02, 0x82,
        ];
        let frame = decode_one(&raw).unwrap().unwrap();
        match frame {
            Frame::PushPromise(f) => {
                assert_eq!(f.stream_id.value(), 1);
                assert_eq!(f.promised_stream_id.value(), 2);
                assert!(f.end_headers);
                assert_eq!(f.fragment.as_ref(), &[0x82]);
            }
            other => panic!("expected PUSH_PROMISE, got {other:?}"),
        }
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let mut raw = Vec::new();
        // Two PING frames back to back.
        for byte in [0x11u8, 0x22] {
            raw.extend_from_slice(&[0x00, 0x00, 0x08, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00]);
            raw.extend_from_slice(&[byte; 8]);
        }
        let mut buf = BytesMut::from(&raw[..]);
        let decoder = FrameDecoder::new();

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Frame::Ping(p) if p.payload == [0x11; 8]));
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Frame::Ping(p) if p.payload == [0x22; 8]));
        assert!(buf.is_empty());
    }
}
