//! Typed frames to wire bytes.

use bytes::{BufMut, BytesMut};

use super::types::*;
use super::{flags, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};

/// Serializes frames, honoring the peer's advertised SETTINGS_MAX_FRAME_SIZE.
///
/// Header blocks and DATA payloads larger than the limit are split: header
/// blocks into CONTINUATION frames (only the last carries END_HEADERS), DATA
/// into multiple frames (END_STREAM only on the final piece).
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Update the limit when the peer changes SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    fn put_header(
        &self,
        buf: &mut BytesMut,
        length: usize,
        frame_type: u8,
        frame_flags: u8,
        stream_id: StreamId,
    ) {
        debug_assert!(length <= 0xFF_FFFF);
        buf.reserve(FRAME_HEADER_SIZE + length);
        buf.put_u8((length >> 16) as u8);
        buf.put_u8((length >> 8) as u8);
        buf.put_u8(length as u8);
        buf.put_u8(frame_type);
        buf.put_u8(frame_flags);
        // Reserved bit is always transmitted as zero.
        buf.put_u32(stream_id.value() & 0x7FFF_FFFF);
    }

    fn put_priority_spec(&self, buf: &mut BytesMut, priority: &PrioritySpec) {
        let mut word = priority.dependency.value() & 0x7FFF_FFFF;
        if priority.exclusive {
            word |= 0x8000_0000;
        }
        buf.put_u32(word);
        debug_assert!((1..=256).contains(&priority.weight));
        buf.put_u8((priority.weight - 1) as u8);
    }

    /// Encode a single frame. DATA and header-bearing frames must already fit
    /// the frame-size limit; use the splitting helpers otherwise.
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) {
        match frame {
            Frame::Data(f) => {
                debug_assert!(f.data.len() <= self.max_frame_size as usize);
                let mut fl = 0;
                if f.end_stream {
                    fl |= flags::END_STREAM;
                }
                self.put_header(buf, f.data.len(), FrameType::Data as u8, fl, f.stream_id);
                buf.extend_from_slice(&f.data);
            }
            Frame::Headers(f) => {
                let mut fl = 0;
                if f.end_stream {
                    fl |= flags::END_STREAM;
                }
                if f.end_headers {
                    fl |= flags::END_HEADERS;
                }
                if f.priority.is_some() {
                    fl |= flags::PRIORITY;
                }
                let prefix = if f.priority.is_some() { 5 } else { 0 };
                self.put_header(
                    buf,
                    prefix + f.fragment.len(),
                    FrameType::Headers as u8,
                    fl,
                    f.stream_id,
                );
                if let Some(priority) = &f.priority {
                    self.put_priority_spec(buf, priority);
                }
                buf.extend_from_slice(&f.fragment);
            }
            Frame::Priority(f) => {
                self.put_header(buf, 5, FrameType::Priority as u8, 0, f.stream_id);
                self.put_priority_spec(buf, &f.priority);
            }
            Frame::RstStream(f) => {
                self.put_header(buf, 4, FrameType::RstStream as u8, 0, f.stream_id);
                buf.put_u32(f.error_code);
            }
            Frame::Settings(f) => {
                let (fl, length) = if f.ack {
                    (flags::ACK, 0)
                } else {
                    (0, f.settings.len() * 6)
                };
                self.put_header(buf, length, FrameType::Settings as u8, fl, StreamId::CONNECTION);
                if !f.ack {
                    for setting in &f.settings {
                        buf.put_u16(setting.id.to_u16());
                        buf.put_u32(setting.value);
                    }
                }
            }
            Frame::PushPromise(f) => {
                let mut fl = 0;
                if f.end_headers {
                    fl |= flags::END_HEADERS;
                }
                self.put_header(
                    buf,
                    4 + f.fragment.len(),
                    FrameType::PushPromise as u8,
                    fl,
                    f.stream_id,
                );
                buf.put_u32(f.promised_stream_id.value() & 0x7FFF_FFFF);
                buf.extend_from_slice(&f.fragment);
            }
            Frame::Ping(f) => {
                let fl = if f.ack { flags::ACK } else { 0 };
                self.put_header(buf, 8, FrameType::Ping as u8, fl, StreamId::CONNECTION);
                buf.extend_from_slice(&f.payload);
            }
            Frame::GoAway(f) => {
                self.put_header(
                    buf,
                    8 + f.debug_data.len(),
                    FrameType::GoAway as u8,
                    0,
                    StreamId::CONNECTION,
                );
                buf.put_u32(f.last_stream_id.value() & 0x7FFF_FFFF);
                buf.put_u32(f.error_code);
                buf.extend_from_slice(&f.debug_data);
            }
            Frame::WindowUpdate(f) => {
                self.put_header(buf, 4, FrameType::WindowUpdate as u8, 0, f.stream_id);
                buf.put_u32(f.increment & 0x7FFF_FFFF);
            }
            Frame::Continuation(f) => {
                let fl = if f.end_headers { flags::END_HEADERS } else { 0 };
                self.put_header(
                    buf,
                    f.fragment.len(),
                    FrameType::Continuation as u8,
                    fl,
                    f.stream_id,
                );
                buf.extend_from_slice(&f.fragment);
            }
            Frame::Unknown(f) => {
                self.put_header(buf, f.payload.len(), f.frame_type, f.flags, f.stream_id);
                buf.extend_from_slice(&f.payload);
            }
        }
    }

    /// Emit a complete header block as HEADERS plus however many
    /// CONTINUATION frames the frame-size limit requires.
    ///
    /// The frames are written contiguously, so the block is uninterruptible
    /// on the wire by construction.
    pub fn encode_header_block(
        &self,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        priority: Option<PrioritySpec>,
        buf: &mut BytesMut,
    ) {
        let prefix = if priority.is_some() { 5 } else { 0 };
        let first_budget = (self.max_frame_size as usize).saturating_sub(prefix);
        let (first, rest) = block.split_at(block.len().min(first_budget));

        let mut fl = 0;
        if end_stream {
            fl |= flags::END_STREAM;
        }
        if rest.is_empty() {
            fl |= flags::END_HEADERS;
        }
        if priority.is_some() {
            fl |= flags::PRIORITY;
        }
        self.put_header(
            buf,
            prefix + first.len(),
            FrameType::Headers as u8,
            fl,
            stream_id,
        );
        if let Some(priority) = &priority {
            self.put_priority_spec(buf, priority);
        }
        buf.extend_from_slice(first);

        self.encode_continuations(stream_id, rest, buf);
    }

    /// Emit a PUSH_PROMISE block, splitting into CONTINUATION frames as
    /// needed. The 4-octet promised-stream-id prefix counts against the
    /// first frame's budget.
    pub fn encode_push_promise_block(
        &self,
        stream_id: StreamId,
        promised_stream_id: StreamId,
        block: &[u8],
        buf: &mut BytesMut,
    ) {
        let first_budget = (self.max_frame_size as usize).saturating_sub(4);
        let (first, rest) = block.split_at(block.len().min(first_budget));

        let fl = if rest.is_empty() { flags::END_HEADERS } else { 0 };
        self.put_header(
            buf,
            4 + first.len(),
            FrameType::PushPromise as u8,
            fl,
            stream_id,
        );
        buf.put_u32(promised_stream_id.value() & 0x7FFF_FFFF);
        buf.extend_from_slice(first);

        self.encode_continuations(stream_id, rest, buf);
    }

    fn encode_continuations(&self, stream_id: StreamId, mut rest: &[u8], buf: &mut BytesMut) {
        while !rest.is_empty() {
            let take = rest.len().min(self.max_frame_size as usize);
            let (chunk, remainder) = rest.split_at(take);
            rest = remainder;

            let fl = if rest.is_empty() { flags::END_HEADERS } else { 0 };
            self.put_header(buf, chunk.len(), FrameType::Continuation as u8, fl, stream_id);
            buf.extend_from_slice(chunk);
        }
    }

    /// Emit DATA for `data`, splitting across frames when it exceeds the
    /// frame-size limit. END_STREAM is set only on the final frame, and only
    /// when `end_stream` is requested.
    pub fn encode_data_frames(
        &self,
        stream_id: StreamId,
        data: &[u8],
        end_stream: bool,
        buf: &mut BytesMut,
    ) {
        if data.is_empty() {
            let fl = if end_stream { flags::END_STREAM } else { 0 };
            self.put_header(buf, 0, FrameType::Data as u8, fl, stream_id);
            return;
        }

        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(self.max_frame_size as usize);
            let (chunk, remainder) = rest.split_at(take);
            rest = remainder;

            let fl = if rest.is_empty() && end_stream {
                flags::END_STREAM
            } else {
                0
            };
            self.put_header(buf, chunk.len(), FrameType::Data as u8, fl, stream_id);
            buf.extend_from_slice(chunk);
        }
    }
}
