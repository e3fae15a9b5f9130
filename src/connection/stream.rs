//! Per-stream lifecycle and buffering (RFC 7540 Section 5.1).

use std::collections::VecDeque;

use bytes::Bytes;

use crate::flow::FlowWindows;
use crate::frame::{ErrorCode, StreamId};
use crate::hpack::HeaderField;

use super::Http2Error;

/// Stream states, exactly the RFC 7540 Section 5.1 diagram. There is no
/// transition out of `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Whether a received HEADERS block opens the stream or trails its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersKind {
    Initial,
    Trailers,
}

/// One HTTP/2 stream: state, windows, and the body bytes buffered in each
/// direction.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: StreamState,
    pub flow: FlowWindows,

    /// Response/request body bytes accepted from the application, not yet
    /// scheduled as DATA.
    send_buf: VecDeque<Bytes>,
    send_buffered: usize,
    /// END_STREAM is owed once `send_buf` drains.
    pub end_after_send: bool,
    /// Trailer fields to emit after the body, instead of a bare END_STREAM.
    pub pending_trailers: Option<Vec<HeaderField>>,
    /// A header block accepted from the application but not yet scheduled
    /// (deferred response headers).
    pub pending_head: Option<Vec<HeaderField>>,
    /// Response headers have been put on the wire.
    pub headers_sent: bool,

    /// Received body bytes the application has not read yet.
    recv_buf: VecDeque<Bytes>,
    /// The initial inbound header block arrived; any further HEADERS on
    /// this stream can only be trailers.
    recv_headers_seen: bool,
    /// Peer sent END_STREAM; `recv_buf` holds the complete remainder.
    pub recv_finished: bool,

    /// Set when the stream was torn down by RST_STREAM (either direction).
    pub reset: Option<ErrorCode>,
}

impl Stream {
    pub fn new(id: StreamId, send_window: u32, recv_window: u32, update_threshold: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            flow: FlowWindows::new(send_window, recv_window, update_threshold),
            send_buf: VecDeque::new(),
            send_buffered: 0,
            end_after_send: false,
            pending_trailers: None,
            pending_head: None,
            headers_sent: false,
            recv_buf: VecDeque::new(),
            recv_headers_seen: false,
            recv_finished: false,
            reset: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Streams in any state but idle and closed count against
    /// SETTINGS_MAX_CONCURRENT_STREAMS.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, StreamState::Idle | StreamState::Closed)
    }

    /// Whether a PUSH_PROMISE may reference this stream as its parent.
    pub fn can_carry_promise(&self) -> bool {
        matches!(
            self.state,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        )
    }

    // -- receive-direction transitions ------------------------------------

    /// A complete HEADERS block arrived for this stream.
    pub fn recv_headers(&mut self, end_stream: bool) -> Result<HeadersKind, Http2Error> {
        match self.state {
            StreamState::Idle => {
                self.recv_headers_seen = true;
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
                Ok(HeadersKind::Initial)
            }
            StreamState::ReservedRemote => {
                self.recv_headers_seen = true;
                self.state = if end_stream {
                    StreamState::Closed
                } else {
                    StreamState::HalfClosedLocal
                };
                Ok(HeadersKind::Initial)
            }
            StreamState::Open | StreamState::HalfClosedLocal => {
                if !self.recv_headers_seen {
                    // First inbound block on a stream we opened: this is
                    // the response, not trailers.
                    self.recv_headers_seen = true;
                    if end_stream {
                        self.recv_end();
                    }
                    return Ok(HeadersKind::Initial);
                }
                if !end_stream {
                    // A second header block is only legal as trailers, and
                    // trailers must end the stream.
                    return Err(Http2Error::connection(
                        ErrorCode::ProtocolError,
                        "HEADERS after the initial block must carry END_STREAM",
                    ));
                }
                self.recv_end();
                Ok(HeadersKind::Trailers)
            }
            StreamState::ReservedLocal => Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "HEADERS on a stream reserved by us",
            )),
            StreamState::HalfClosedRemote | StreamState::Closed => Err(Http2Error::stream(
                self.id,
                ErrorCode::StreamClosed,
                "HEADERS after END_STREAM",
            )),
        }
    }

    /// DATA arrived for this stream. Flow-control accounting is the
    /// connection's job; this only validates the state machine.
    pub fn recv_data(&mut self, end_stream: bool) -> Result<(), Http2Error> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {
                if end_stream {
                    self.recv_end();
                }
                Ok(())
            }
            StreamState::HalfClosedRemote | StreamState::Closed => Err(Http2Error::stream(
                self.id,
                ErrorCode::StreamClosed,
                "DATA after END_STREAM",
            )),
            StreamState::Idle | StreamState::ReservedLocal | StreamState::ReservedRemote => {
                Err(Http2Error::connection(
                    ErrorCode::ProtocolError,
                    "DATA on a stream that is not open",
                ))
            }
        }
    }

    fn recv_end(&mut self) {
        self.recv_finished = true;
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    // -- send-direction transitions ---------------------------------------

    /// We are putting a HEADERS block on the wire.
    pub fn send_headers(&mut self, end_stream: bool) -> Result<(), Http2Error> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
                self.headers_sent = true;
                Ok(())
            }
            StreamState::ReservedLocal => {
                self.state = StreamState::HalfClosedRemote;
                self.headers_sent = true;
                if end_stream {
                    self.send_end();
                }
                Ok(())
            }
            StreamState::Open | StreamState::HalfClosedRemote => {
                self.headers_sent = true;
                if end_stream {
                    self.send_end();
                }
                Ok(())
            }
            StreamState::HalfClosedLocal | StreamState::Closed => Err(Http2Error::stream(
                self.id,
                ErrorCode::StreamClosed,
                "send on a closed stream",
            )),
            StreamState::ReservedRemote => Err(Http2Error::stream(
                self.id,
                ErrorCode::ProtocolError,
                "send on a stream reserved by the peer",
            )),
        }
    }

    /// We put END_STREAM on the wire.
    pub fn send_end(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// We sent PUSH_PROMISE naming this stream.
    pub fn reserve_local(&mut self) {
        debug_assert_eq!(self.state, StreamState::Idle);
        self.state = StreamState::ReservedLocal;
    }

    /// The peer sent PUSH_PROMISE naming this stream.
    pub fn reserve_remote(&mut self) {
        debug_assert_eq!(self.state, StreamState::Idle);
        self.state = StreamState::ReservedRemote;
    }

    /// RST_STREAM in either direction: the stream dies immediately and any
    /// queued output is dropped.
    pub fn apply_reset(&mut self, code: ErrorCode) {
        self.state = StreamState::Closed;
        self.reset = Some(code);
        self.send_buf.clear();
        self.send_buffered = 0;
        self.recv_buf.clear();
        self.end_after_send = false;
        self.pending_trailers = None;
        self.pending_head = None;
    }

    // -- body buffering ----------------------------------------------------

    pub fn queue_send(&mut self, data: Bytes) {
        self.send_buffered += data.len();
        if !data.is_empty() {
            self.send_buf.push_back(data);
        }
    }

    pub fn send_buffered(&self) -> usize {
        self.send_buffered
    }

    pub fn has_send_data(&self) -> bool {
        self.send_buffered > 0
    }

    /// Detach up to `max` octets of queued body for one DATA frame.
    pub fn take_sendable(&mut self, max: usize) -> Bytes {
        let front = match self.send_buf.front_mut() {
            Some(front) => front,
            None => return Bytes::new(),
        };
        let chunk = if front.len() <= max {
            self.send_buf.pop_front().unwrap()
        } else {
            front.split_to(max)
        };
        self.send_buffered -= chunk.len();
        chunk
    }

    pub fn deposit_recv(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.recv_buf.push_back(data);
        }
    }

    /// Hand the application the next buffered body chunk, if any.
    pub fn read_recv(&mut self) -> Option<Bytes> {
        self.recv_buf.pop_front()
    }

    pub fn recv_buffered(&self) -> usize {
        self.recv_buf.iter().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::new(StreamId::new(1), 65_535, 65_535, 4096)
    }

    #[test]
    fn request_response_lifecycle() {
        let mut s = stream();
        assert_eq!(s.state(), StreamState::Idle);

        assert_eq!(s.recv_headers(false).unwrap(), HeadersKind::Initial);
        assert_eq!(s.state(), StreamState::Open);

        s.recv_data(true).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);

        s.send_headers(false).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);

        s.send_end();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn headers_with_end_stream_skips_open() {
        let mut s = stream();
        s.recv_headers(true).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
        assert!(s.recv_finished);
    }

    #[test]
    fn trailers_require_end_stream() {
        let mut s = stream();
        s.recv_headers(false).unwrap();

        let err = s.recv_headers(false).unwrap_err();
        assert!(err.is_connection_level());
        assert_eq!(err.code(), ErrorCode::ProtocolError);

        // With END_STREAM it is a legal trailer block.
        let mut s = stream();
        s.recv_headers(false).unwrap();
        assert_eq!(s.recv_headers(true).unwrap(), HeadersKind::Trailers);
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn data_after_end_stream_is_stream_error() {
        let mut s = stream();
        s.recv_headers(true).unwrap();
        let err = s.recv_data(false).unwrap_err();
        assert!(!err.is_connection_level());
        assert_eq!(err.code(), ErrorCode::StreamClosed);
    }

    #[test]
    fn push_reservation_lifecycle_local() {
        let mut s = stream();
        s.reserve_local();
        assert_eq!(s.state(), StreamState::ReservedLocal);
        assert!(s.is_active());

        s.send_headers(false).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);

        s.send_end();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn push_reservation_lifecycle_remote() {
        let mut s = stream();
        s.reserve_remote();
        s.recv_headers(false).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        s.recv_data(true).unwrap();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn no_transition_out_of_closed() {
        let mut s = stream();
        s.recv_headers(true).unwrap();
        s.apply_reset(ErrorCode::Cancel);
        assert!(s.is_closed());

        assert!(s.recv_headers(false).is_err());
        assert!(s.recv_data(false).is_err());
        assert!(s.send_headers(false).is_err());
        s.send_end();
        assert!(s.is_closed());
    }

    #[test]
    fn reset_drops_queued_output() {
        let mut s = stream();
        s.recv_headers(false).unwrap();
        s.queue_send(Bytes::from_static(b"pending"));
        s.end_after_send = true;

        s.apply_reset(ErrorCode::Cancel);
        assert!(!s.has_send_data());
        assert!(!s.end_after_send);
        assert_eq!(s.reset, Some(ErrorCode::Cancel));
    }

    #[test]
    fn take_sendable_respects_limit() {
        let mut s = stream();
        s.queue_send(Bytes::from_static(b"hello world"));
        assert_eq!(s.send_buffered(), 11);

        let chunk = s.take_sendable(5);
        assert_eq!(chunk.as_ref(), b"hello");
        assert_eq!(s.send_buffered(), 6);

        let chunk = s.take_sendable(100);
        assert_eq!(chunk.as_ref(), b" world");
        assert!(!s.has_send_data());
    }

    #[test]
    fn recv_buffering() {
        let mut s = stream();
        s.deposit_recv(Bytes::from_static(b"part1"));
        s.deposit_recv(Bytes::from_static(b"part2"));
        assert_eq!(s.recv_buffered(), 10);

        assert_eq!(s.read_recv().unwrap().as_ref(), b"part1");
        assert_eq!(s.read_recv().unwrap().as_ref(), b"part2");
        assert!(s.read_recv().is_none());
    }
}
