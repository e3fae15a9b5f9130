//! Role-neutral connection machinery.
//!
//! Owns everything a connection shares between its two directions: frame
//! codecs, HPACK state, the stream map, the priority tree, flow-control
//! windows, and the scheduled output queue. The server and client wrappers
//! drive this core and translate its events.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::flow::FlowWindows;
use crate::frame::{
    ContinuationFrame, DataFrame, ErrorCode, Frame, FrameDecoder, FrameEncoder, FrameError,
    FrameHeader, FrameType, GoAwayFrame, HeadersFrame, PingFrame, PrioritySpec, PushPromiseFrame,
    RstStreamFrame, Setting, SettingsFrame, StreamId, WindowUpdateFrame,
    CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, FRAME_HEADER_SIZE,
};
use crate::hpack::{HeaderField, HpackDecoder, HpackEncoder};
use crate::io::{Continuation, ReadOperation, WriteOperation, WriteQueue, WriteResult};
use crate::priority::PriorityTree;

use super::settings::SettingsState;
use super::stream::{HeadersKind, Stream, StreamState};
use super::{Config, Http2Error};

/// Reassembled header blocks larger than this kill the connection rather
/// than the allocator.
const MAX_HEADER_BLOCK_SIZE: usize = 1 << 20;

/// Which end of the connection this core is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Server: waiting for the 24-octet client preface.
    AwaitingPreface,
    /// Waiting for the peer's initial SETTINGS frame.
    AwaitingSettings,
    Open,
}

/// Protocol events the role wrappers translate for the application.
#[derive(Debug)]
pub(crate) enum CoreEvent {
    /// Preface and initial SETTINGS exchange completed.
    Ready,
    /// A complete header block was received and decoded.
    HeaderBlock {
        stream_id: StreamId,
        fields: Vec<HeaderField>,
        end_stream: bool,
        kind: HeadersKind,
    },
    /// The peer promised a pushed stream (client side only).
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        fields: Vec<HeaderField>,
    },
    /// Body bytes were deposited for a stream.
    Data {
        stream_id: StreamId,
        end_stream: bool,
    },
    /// A stream died, by peer RST_STREAM or local reset.
    StreamReset {
        stream_id: StreamId,
        code: ErrorCode,
    },
    /// The peer is going away.
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug_data: Bytes,
    },
    /// One of our PINGs was acknowledged; the caller owns the timing.
    PingAck { payload: [u8; 8] },
    /// The peer acknowledged our most recent SETTINGS.
    SettingsAcked,
    /// A connection-level failure; GOAWAY is queued and the engine drains.
    Error(Http2Error),
}

/// In-flight reassembly of a HEADERS / PUSH_PROMISE + CONTINUATION block.
///
/// While one of these is live no other frame may appear on the connection
/// (RFC 7540 Section 4.3).
struct BlockAssembly {
    stream_id: StreamId,
    end_stream: bool,
    promised: Option<StreamId>,
    priority: Option<PrioritySpec>,
    fragment: BytesMut,
}

pub(crate) struct ConnectionCore {
    role: Role,
    config: Config,
    phase: Phase,

    frame_decoder: FrameDecoder,
    frame_encoder: FrameEncoder,
    hpack_rx: HpackDecoder,
    hpack_tx: HpackEncoder,

    pub(crate) settings: SettingsState,
    streams: HashMap<u32, Stream>,
    priority: PriorityTree,
    conn_flow: FlowWindows,

    read_buf: BytesMut,
    /// Remaining octets of an oversized DATA frame being skipped after a
    /// stream-level FRAME_SIZE_ERROR.
    discard_remaining: usize,
    out: WriteQueue,
    events: VecDeque<CoreEvent>,
    assembly: Option<BlockAssembly>,

    /// Highest stream id the peer has opened.
    last_peer_stream_id: u32,
    /// Highest stream id we have opened (requests or pushes).
    last_local_stream_id: u32,

    pings_in_flight: VecDeque<[u8; 8]>,
    goaway_sent: Option<ErrorCode>,
    goaway_received: Option<StreamId>,
    fatal: Option<Http2Error>,
    shutdown_requested: bool,
    read_eof: bool,
    closed: bool,

    reader_parked: Option<Continuation>,
    writer_parked: Option<Continuation>,
}

impl ConnectionCore {
    pub(crate) fn new(role: Role, config: Config) -> Self {
        let accepts_push = role == Role::Client && config.enable_server_push;
        let local = config.to_settings(accepts_push);
        let threshold = config.request_body_buffer_size as u32;

        let mut core = Self {
            role,
            config,
            phase: match role {
                Role::Server => Phase::AwaitingPreface,
                Role::Client => Phase::AwaitingSettings,
            },
            frame_decoder: FrameDecoder::new(),
            frame_encoder: FrameEncoder::new(),
            hpack_rx: HpackDecoder::new(),
            hpack_tx: HpackEncoder::new(),
            settings: SettingsState::new(local),
            streams: HashMap::new(),
            priority: PriorityTree::new(),
            conn_flow: FlowWindows::new(
                DEFAULT_INITIAL_WINDOW_SIZE,
                DEFAULT_INITIAL_WINDOW_SIZE,
                threshold,
            ),
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            discard_remaining: 0,
            out: WriteQueue::new(),
            events: VecDeque::new(),
            assembly: None,
            last_peer_stream_id: 0,
            last_local_stream_id: 0,
            pings_in_flight: VecDeque::new(),
            goaway_sent: None,
            goaway_received: None,
            fatal: None,
            shutdown_requested: false,
            read_eof: false,
            closed: false,
            reader_parked: None,
            writer_parked: None,
        };

        if role == Role::Client {
            // Clients speak first: preface, then SETTINGS.
            core.out.push(Bytes::from_static(CONNECTION_PREFACE));
            core.send_local_settings(local.to_wire());
        }
        core
    }

    fn send_local_settings(&mut self, settings: Vec<Setting>) {
        self.send_frame(&Frame::Settings(SettingsFrame {
            ack: false,
            settings,
        }));
    }

    // -- reader surface ----------------------------------------------------

    pub(crate) fn next_read_operation(&self) -> ReadOperation {
        if self.closed || self.fatal.is_some() || self.read_eof {
            ReadOperation::Close
        } else if self.recv_saturated() {
            ReadOperation::Yield
        } else {
            ReadOperation::Read
        }
    }

    /// Unread body bytes have piled up past the read-buffer budget; stop
    /// asking for input until the application drains them.
    fn recv_saturated(&self) -> bool {
        let buffered: usize = self.streams.values().map(|s| s.recv_buffered()).sum();
        buffered >= self.config.read_buffer_size
    }

    /// Feed received bytes. Complete frames are processed immediately;
    /// a trailing partial frame stays buffered. Returns the octets accepted.
    pub(crate) fn read(&mut self, data: &[u8]) -> usize {
        if self.closed || self.fatal.is_some() || self.read_eof {
            return 0;
        }
        self.read_buf.extend_from_slice(data);
        self.process();
        data.len()
    }

    /// Final bytes plus end-of-input. A partial frame left in the buffer is
    /// a protocol error.
    pub(crate) fn read_eof(&mut self, data: &[u8]) -> usize {
        let n = self.read(data);
        self.read_eof = true;
        if (!self.read_buf.is_empty() || self.discard_remaining > 0 || self.assembly.is_some())
            && self.fatal.is_none()
        {
            self.fatal(Http2Error::connection(
                ErrorCode::ProtocolError,
                "peer closed mid-frame",
            ));
        }
        self.wake_writer();
        self.wake_reader_if_actionable();
        n
    }

    pub(crate) fn yield_reader(&mut self, k: Continuation) {
        self.reader_parked = Some(k);
        // The state may already have moved on; do not strand the caller.
        self.wake_reader_if_actionable();
    }

    /// Resume a parked reader once reading is worthwhile again: buffers
    /// drained below the budget, or the read direction reached its end
    /// state and the adapter must observe `Close`.
    fn wake_reader_if_actionable(&mut self) {
        if self.reader_parked.is_none() {
            return;
        }
        if self.closed || self.fatal.is_some() || self.read_eof || !self.recv_saturated() {
            if let Some(k) = self.reader_parked.take() {
                k();
            }
        }
    }

    // -- writer surface ----------------------------------------------------

    pub(crate) fn next_write_operation(&mut self) -> WriteOperation {
        if self.closed {
            return WriteOperation::Close(self.out.total_flushed());
        }
        self.pump();
        if !self.out.is_empty() {
            return WriteOperation::Write(self.out.slices());
        }
        let draining = self.fatal.is_some()
            || ((self.shutdown_requested || self.read_eof) && self.streams.is_empty());
        if draining {
            self.closed = true;
            return WriteOperation::Close(self.out.total_flushed());
        }
        WriteOperation::Yield
    }

    pub(crate) fn report_write_result(&mut self, result: WriteResult) {
        match result {
            WriteResult::Written(n) => {
                self.out.consume(n);
            }
            WriteResult::Closed => {
                self.out.clear();
                self.closed = true;
                self.wake_reader_if_actionable();
            }
        }
    }

    pub(crate) fn yield_writer(&mut self, k: Continuation) {
        self.writer_parked = Some(k);
    }

    fn wake_writer(&mut self) {
        if let Some(k) = self.writer_parked.take() {
            k();
        }
    }

    /// The adapter hit an error it cannot recover from.
    pub(crate) fn report_exn(&mut self, reason: &str) {
        self.events.push_back(CoreEvent::Error(Http2Error::connection(
            ErrorCode::InternalError,
            reason,
        )));
        self.out.clear();
        self.closed = true;
        self.wake_writer();
        self.wake_reader_if_actionable();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Graceful shutdown: GOAWAY with NO_ERROR, let in-flight streams
    /// finish, close once everything drains.
    pub(crate) fn shutdown(&mut self) {
        if self.goaway_sent.is_none() {
            self.send_goaway(ErrorCode::NoError, b"");
        }
        self.shutdown_requested = true;
        self.wake_writer();
    }

    pub(crate) fn poll_events(&mut self) -> Vec<CoreEvent> {
        self.events.drain(..).collect()
    }

    // -- frame pipeline ----------------------------------------------------

    fn process(&mut self) {
        if self.phase == Phase::AwaitingPreface {
            if self.read_buf.len() < CONNECTION_PREFACE.len() {
                if !CONNECTION_PREFACE.starts_with(&self.read_buf) {
                    self.fatal(Http2Error::connection(
                        ErrorCode::ProtocolError,
                        "invalid connection preface",
                    ));
                }
                return;
            }
            if &self.read_buf[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
                self.fatal(Http2Error::connection(
                    ErrorCode::ProtocolError,
                    "invalid connection preface",
                ));
                return;
            }
            let _ = self.read_buf.split_to(CONNECTION_PREFACE.len());
            debug!("client preface accepted");
            let wire = self
                .settings
                .sent
                .front()
                .map(|s| s.to_wire())
                .unwrap_or_default();
            self.send_local_settings(wire);
            self.phase = Phase::AwaitingSettings;
        }

        loop {
            if self.fatal.is_some() || self.closed {
                return;
            }
            if self.discard_remaining > 0 {
                let drop = self.discard_remaining.min(self.read_buf.len());
                let _ = self.read_buf.split_to(drop);
                self.discard_remaining -= drop;
                if self.discard_remaining > 0 {
                    break;
                }
            }
            match self.frame_decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    if let Err(err) = self.handle_frame(frame) {
                        self.handle_error(err);
                    }
                }
                Ok(None) => break,
                Err(err) => self.handle_frame_error(err),
            }
        }

        self.pump();
    }

    /// Classify a decoder error: an oversized DATA frame on a live stream
    /// only kills that stream (the payload is skipped); everything else is
    /// fatal. Oversized HEADERS and CONTINUATION cannot be skipped because
    /// the HPACK state would desynchronize.
    fn handle_frame_error(&mut self, err: FrameError) {
        if let FrameError::OversizedFrame { length, .. } = err {
            debug_assert!(self.read_buf.len() >= FRAME_HEADER_SIZE);
            let header = FrameHeader::parse(&self.read_buf);
            let downgradable = header.frame_type == FrameType::Data as u8
                && self.assembly.is_none()
                && self.streams.contains_key(&header.stream_id.value());
            if downgradable {
                self.reset_stream_with(header.stream_id, ErrorCode::FrameSizeError);
                let total = FRAME_HEADER_SIZE + length as usize;
                let now = total.min(self.read_buf.len());
                let _ = self.read_buf.split_to(now);
                self.discard_remaining = total - now;
                return;
            }
        }
        self.fatal(Http2Error::connection(err.code(), err.to_string()));
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Http2Error> {
        // A header block in flight shuts out every other frame on the
        // connection until END_HEADERS.
        if let Some(assembly) = &self.assembly {
            match &frame {
                Frame::Continuation(c) if c.stream_id == assembly.stream_id => {}
                _ => {
                    return Err(Http2Error::connection(
                        ErrorCode::ProtocolError,
                        "frame interleaved inside a header block",
                    ));
                }
            }
        }

        // The first frame after the preface must be the peer's SETTINGS.
        if self.phase == Phase::AwaitingSettings
            && !matches!(&frame, Frame::Settings(s) if !s.ack)
        {
            return Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "expected SETTINGS after connection preface",
            ));
        }

        match frame {
            Frame::Data(f) => self.handle_data(f),
            Frame::Headers(f) => self.handle_headers(f),
            Frame::Priority(f) => {
                self.priority.reprioritize(f.stream_id, f.priority);
                Ok(())
            }
            Frame::RstStream(f) => self.handle_rst_stream(f),
            Frame::Settings(f) => self.handle_settings(f),
            Frame::PushPromise(f) => self.handle_push_promise(f),
            Frame::Ping(f) => self.handle_ping(f),
            Frame::GoAway(f) => self.handle_goaway(f),
            Frame::WindowUpdate(f) => self.handle_window_update(f),
            Frame::Continuation(f) => self.handle_continuation(f),
            Frame::Unknown(f) => {
                trace!(frame_type = f.frame_type, "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    fn handle_data(&mut self, frame: DataFrame) -> Result<(), Http2Error> {
        let id = frame.stream_id;
        let total = frame.data.len() + frame.padding as usize;

        // Connection window first; it covers every DATA octet including
        // those on dead streams.
        self.conn_flow.debit_recv(total).map_err(|_| {
            Http2Error::connection(
                ErrorCode::FlowControlError,
                "connection flow-control window exceeded",
            )
        })?;

        let Some(stream) = self.streams.get_mut(&id.value()) else {
            if self.is_recently_closed(id) {
                // Dead stream: swallow the data but return the credit.
                if let Some(increment) = self.conn_flow.release(total) {
                    self.send_window_update(StreamId::CONNECTION, increment);
                }
                return Ok(());
            }
            return Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "DATA on an idle stream",
            ));
        };

        stream.flow.debit_recv(total).map_err(|_| {
            Http2Error::stream(
                id,
                ErrorCode::FlowControlError,
                "stream flow-control window exceeded",
            )
        })?;
        stream.recv_data(frame.end_stream)?;
        stream.deposit_recv(frame.data);

        // Padding never reaches the application; hand its window back now.
        if frame.padding > 0 {
            let padding = frame.padding as usize;
            let released = self
                .streams
                .get_mut(&id.value())
                .and_then(|s| s.flow.release(padding));
            if let Some(increment) = released {
                self.send_window_update(id, increment);
            }
            let released = self.conn_flow.release(padding);
            if let Some(increment) = released {
                self.send_window_update(StreamId::CONNECTION, increment);
            }
        }

        self.events.push_back(CoreEvent::Data {
            stream_id: id,
            end_stream: frame.end_stream,
        });
        Ok(())
    }

    fn handle_headers(&mut self, frame: HeadersFrame) -> Result<(), Http2Error> {
        let id = frame.stream_id;

        if !self.streams.contains_key(&id.value()) {
            // A new stream must carry the peer's parity and a fresh id.
            if !self.is_peer_initiated(id) {
                return Err(Http2Error::connection(
                    ErrorCode::ProtocolError,
                    "HEADERS on a stream this endpoint would initiate",
                ));
            }
            if id.value() <= self.last_peer_stream_id {
                return Err(Http2Error::connection(
                    ErrorCode::ProtocolError,
                    "stream id reused or not monotonically increasing",
                ));
            }
            if self.role == Role::Client {
                // Servers open streams with PUSH_PROMISE, never bare HEADERS.
                return Err(Http2Error::connection(
                    ErrorCode::ProtocolError,
                    "HEADERS on a stream without a PUSH_PROMISE",
                ));
            }
        }

        if !frame.end_headers {
            self.assembly = Some(BlockAssembly {
                stream_id: id,
                end_stream: frame.end_stream,
                promised: None,
                priority: frame.priority,
                fragment: BytesMut::from(&frame.fragment[..]),
            });
            return Ok(());
        }

        self.finish_header_block(id, &frame.fragment, frame.end_stream, frame.priority, None)
    }

    fn handle_continuation(&mut self, frame: ContinuationFrame) -> Result<(), Http2Error> {
        let Some(assembly) = &mut self.assembly else {
            return Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "CONTINUATION without a preceding header block",
            ));
        };

        assembly.fragment.extend_from_slice(&frame.fragment);
        if assembly.fragment.len() > MAX_HEADER_BLOCK_SIZE {
            return Err(Http2Error::connection(
                ErrorCode::EnhanceYourCalm,
                "header block exceeds the reassembly limit",
            ));
        }
        if !frame.end_headers {
            return Ok(());
        }

        let Some(assembly) = self.assembly.take() else {
            return Ok(());
        };
        let fragment = assembly.fragment.freeze();
        self.finish_header_block(
            assembly.stream_id,
            &fragment,
            assembly.end_stream,
            assembly.priority,
            assembly.promised,
        )
    }

    /// A complete header block: decode it (always, to keep HPACK state in
    /// sync), then apply stream-level consequences.
    fn finish_header_block(
        &mut self,
        id: StreamId,
        fragment: &[u8],
        end_stream: bool,
        priority: Option<PrioritySpec>,
        promised: Option<StreamId>,
    ) -> Result<(), Http2Error> {
        let fields = self.hpack_rx.decode(fragment).map_err(|err| {
            Http2Error::connection(ErrorCode::CompressionError, err.to_string())
        })?;

        if let Some(promised_id) = promised {
            // Client side: materialize the reserved stream.
            let mut stream = self.new_stream(promised_id);
            stream.reserve_remote();
            self.streams.insert(promised_id.value(), stream);
            self.last_peer_stream_id = promised_id.value();
            self.priority.insert(
                promised_id,
                PrioritySpec {
                    dependency: id,
                    ..PrioritySpec::default()
                },
            );
            self.events.push_back(CoreEvent::PushPromise {
                stream_id: id,
                promised_stream_id: promised_id,
                fields,
            });
            return Ok(());
        }

        if let Some(spec) = priority {
            self.priority.insert(id, spec);
        }

        if !self.streams.contains_key(&id.value()) {
            // New peer-initiated stream; id checks ran at frame receipt.
            self.last_peer_stream_id = id.value();

            if self.goaway_sent.is_some() {
                // We are going away; this stream is beyond our advertised
                // last id and may be silently discarded.
                return Ok(());
            }
            let limit = self.settings.acked.max_concurrent_streams;
            if self.active_peer_streams() >= limit as usize {
                return Err(Http2Error::stream(
                    id,
                    ErrorCode::RefusedStream,
                    "SETTINGS_MAX_CONCURRENT_STREAMS exceeded",
                ));
            }
            let stream = self.new_stream(id);
            self.streams.insert(id.value(), stream);
            if !self.priority.contains(id) {
                self.priority.insert(id, PrioritySpec::default());
            }
        }

        let Some(stream) = self.streams.get_mut(&id.value()) else {
            return Ok(());
        };
        let kind = stream.recv_headers(end_stream)?;
        self.events.push_back(CoreEvent::HeaderBlock {
            stream_id: id,
            fields,
            end_stream,
            kind,
        });
        Ok(())
    }

    fn handle_rst_stream(&mut self, frame: RstStreamFrame) -> Result<(), Http2Error> {
        let id = frame.stream_id;
        let Some(stream) = self.streams.get_mut(&id.value()) else {
            if self.is_recently_closed(id) {
                return Ok(());
            }
            return Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "RST_STREAM on an idle stream",
            ));
        };

        let code = ErrorCode::from_u32(frame.error_code);
        debug!(stream = %id, %code, "peer reset stream");
        stream.apply_reset(code);
        self.finalize_stream(id);
        self.events.push_back(CoreEvent::StreamReset {
            stream_id: id,
            code,
        });
        // The reset dropped any buffered body bytes.
        self.wake_reader_if_actionable();
        Ok(())
    }

    fn handle_settings(&mut self, frame: SettingsFrame) -> Result<(), Http2Error> {
        if frame.ack {
            let before = self.settings.acked;
            let Some(acked) = self.settings.on_ack() else {
                return Err(Http2Error::connection(
                    ErrorCode::ProtocolError,
                    "SETTINGS ACK without settings in flight",
                ));
            };
            // Our advertised values now bind the peer; apply the local side
            // effects.
            self.frame_decoder.set_max_frame_size(acked.max_frame_size);
            self.hpack_rx.set_max_capacity(acked.header_table_size as usize);
            self.hpack_rx
                .set_max_header_list_size(acked.max_header_list_size.map(|v| v as usize));
            if acked.initial_window_size != before.initial_window_size {
                let delta =
                    acked.initial_window_size as i32 - before.initial_window_size as i32;
                for stream in self.streams.values_mut() {
                    stream.flow.adjust_recv(delta);
                }
            }
            self.events.push_back(CoreEvent::SettingsAcked);
            return Ok(());
        }

        let before = self.settings.peer;
        for setting in &frame.settings {
            self.settings.peer.apply(*setting);
        }
        let after = self.settings.peer;

        if after.header_table_size != before.header_table_size {
            self.hpack_tx.set_capacity(after.header_table_size as usize);
        }
        if after.max_frame_size != before.max_frame_size {
            self.frame_encoder.set_max_frame_size(after.max_frame_size);
        }
        if after.initial_window_size != before.initial_window_size {
            // Retroactive adjustment of every stream's send window; the
            // connection window is exempt (RFC 7540 Section 6.9.2).
            let delta = after.initial_window_size as i32 - before.initial_window_size as i32;
            for stream in self.streams.values_mut() {
                stream.flow.adjust_send(delta).map_err(|_| {
                    Http2Error::connection(
                        ErrorCode::FlowControlError,
                        "SETTINGS_INITIAL_WINDOW_SIZE overflows a stream window",
                    )
                })?;
            }
        }

        self.send_frame(&Frame::Settings(SettingsFrame {
            ack: true,
            settings: Vec::new(),
        }));

        if self.phase == Phase::AwaitingSettings {
            self.phase = Phase::Open;
            self.events.push_back(CoreEvent::Ready);
        }
        Ok(())
    }

    fn handle_push_promise(&mut self, frame: PushPromiseFrame) -> Result<(), Http2Error> {
        if self.role == Role::Server {
            return Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE from a client",
            ));
        }
        if !self.settings.acked.enable_push {
            return Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE while push is disabled",
            ));
        }

        let parent = frame.stream_id;
        let promised = frame.promised_stream_id;
        let parent_live = self
            .streams
            .get(&parent.value())
            .map(|s| s.can_carry_promise())
            .unwrap_or(false);
        if !parent_live {
            return Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE on an unusable stream",
            ));
        }
        if !self.is_peer_initiated(promised) || promised.value() <= self.last_peer_stream_id {
            return Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "promised stream id invalid",
            ));
        }

        if !frame.end_headers {
            self.assembly = Some(BlockAssembly {
                stream_id: parent,
                end_stream: false,
                promised: Some(promised),
                priority: None,
                fragment: BytesMut::from(&frame.fragment[..]),
            });
            return Ok(());
        }
        self.finish_header_block(parent, &frame.fragment, false, None, Some(promised))
    }

    fn handle_ping(&mut self, frame: PingFrame) -> Result<(), Http2Error> {
        if frame.ack {
            let Some(position) = self
                .pings_in_flight
                .iter()
                .position(|payload| *payload == frame.payload)
            else {
                return Err(Http2Error::connection(
                    ErrorCode::ProtocolError,
                    "PING ACK does not match any ping in flight",
                ));
            };
            self.pings_in_flight.remove(position);
            self.events.push_back(CoreEvent::PingAck {
                payload: frame.payload,
            });
            return Ok(());
        }

        self.send_frame(&Frame::Ping(PingFrame {
            ack: true,
            payload: frame.payload,
        }));
        Ok(())
    }

    fn handle_goaway(&mut self, frame: GoAwayFrame) -> Result<(), Http2Error> {
        let last = frame.last_stream_id;
        let code = ErrorCode::from_u32(frame.error_code);
        debug!(last_stream = %last, %code, "received GOAWAY");
        self.goaway_received = Some(last);

        // Locally initiated streams above the peer's high-water mark were
        // never processed; surface them as refused so the caller can retry
        // elsewhere.
        let abandoned: Vec<StreamId> = self
            .streams
            .values()
            .map(|s| s.id())
            .filter(|id| !self.is_peer_initiated(*id) && id.value() > last.value())
            .collect();
        for id in abandoned {
            if let Some(stream) = self.streams.get_mut(&id.value()) {
                stream.apply_reset(ErrorCode::RefusedStream);
            }
            self.finalize_stream(id);
            self.events.push_back(CoreEvent::StreamReset {
                stream_id: id,
                code: ErrorCode::RefusedStream,
            });
        }

        self.events.push_back(CoreEvent::GoAway {
            last_stream_id: last,
            code,
            debug_data: frame.debug_data,
        });
        Ok(())
    }

    fn handle_window_update(&mut self, frame: WindowUpdateFrame) -> Result<(), Http2Error> {
        if frame.stream_id.is_connection() {
            self.conn_flow.credit_send(frame.increment).map_err(|_| {
                Http2Error::connection(
                    ErrorCode::FlowControlError,
                    "connection send window overflow",
                )
            })?;
            return Ok(());
        }

        let id = frame.stream_id;
        let Some(stream) = self.streams.get_mut(&id.value()) else {
            if self.is_recently_closed(id) {
                return Ok(());
            }
            return Err(Http2Error::connection(
                ErrorCode::ProtocolError,
                "WINDOW_UPDATE on an idle stream",
            ));
        };
        stream.flow.credit_send(frame.increment).map_err(|_| {
            Http2Error::stream(id, ErrorCode::FlowControlError, "stream send window overflow")
        })?;
        Ok(())
    }

    // -- application operations --------------------------------------------

    /// Open a locally initiated stream carrying `fields` (client requests).
    pub(crate) fn open_stream(
        &mut self,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> Result<StreamId, Http2Error> {
        if self.closed || self.fatal.is_some() {
            return Err(Http2Error::connection(
                ErrorCode::InternalError,
                "connection is closed",
            ));
        }
        if self.goaway_received.is_some() {
            return Err(Http2Error::connection(
                ErrorCode::RefusedStream,
                "peer is going away; no new streams",
            ));
        }
        let active_local = self
            .streams
            .values()
            .filter(|s| s.is_active() && !self.is_peer_initiated(s.id()))
            .count();
        if active_local >= self.settings.peer.max_concurrent_streams as usize {
            return Err(Http2Error::connection(
                ErrorCode::RefusedStream,
                "peer's concurrent stream limit reached",
            ));
        }

        let id = StreamId::new(self.next_local_stream_id()?);
        let mut stream = self.new_stream(id);
        stream.send_headers(end_stream)?;
        self.streams.insert(id.value(), stream);
        self.priority.insert(id, PrioritySpec::default());

        self.encode_header_block(id, &fields, end_stream);
        self.wake_writer();
        Ok(id)
    }

    /// Reserve and announce a pushed stream (server side).
    pub(crate) fn push_promise(
        &mut self,
        parent: StreamId,
        fields: Vec<HeaderField>,
    ) -> Result<StreamId, Http2Error> {
        debug_assert_eq!(self.role, Role::Server);
        if !self.config.enable_server_push || !self.settings.peer.enable_push {
            return Err(Http2Error::connection(
                ErrorCode::RefusedStream,
                "push is disabled",
            ));
        }
        if self.goaway_received.is_some() || self.goaway_sent.is_some() {
            return Err(Http2Error::connection(
                ErrorCode::RefusedStream,
                "connection is going away",
            ));
        }
        let parent_live = self
            .streams
            .get(&parent.value())
            .map(|s| s.can_carry_promise())
            .unwrap_or(false);
        if !parent_live {
            return Err(Http2Error::stream(
                parent,
                ErrorCode::StreamClosed,
                "push parent is not open",
            ));
        }

        let promised = StreamId::new(self.next_local_stream_id()?);
        let mut stream = self.new_stream(promised);
        stream.reserve_local();
        self.streams.insert(promised.value(), stream);
        // Pushed streams depend on their parent with default weight.
        self.priority.insert(
            promised,
            PrioritySpec {
                dependency: parent,
                ..PrioritySpec::default()
            },
        );

        let mut block = Vec::with_capacity(self.config.response_buffer_size);
        self.hpack_tx.encode(&fields, &mut block);
        let mut buf = BytesMut::new();
        self.frame_encoder
            .encode_push_promise_block(parent, promised, &block, &mut buf);
        self.out.push(buf.freeze());
        self.wake_writer();
        Ok(promised)
    }

    /// Queue a header block on an existing stream (responses, trailers are
    /// handled by the pump).
    pub(crate) fn send_headers(
        &mut self,
        id: StreamId,
        fields: Vec<HeaderField>,
        end_stream: bool,
        flush_immediately: bool,
    ) -> Result<(), Http2Error> {
        let stream = self
            .streams
            .get_mut(&id.value())
            .ok_or_else(|| closed_stream(id))?;
        if stream.headers_sent || stream.pending_head.is_some() {
            return Err(Http2Error::stream(
                id,
                ErrorCode::InternalError,
                "response headers already sent",
            ));
        }
        stream.end_after_send = end_stream;
        if flush_immediately {
            stream.send_headers(end_stream)?;
            if end_stream {
                stream.end_after_send = false;
            }
            self.encode_header_block(id, &fields, end_stream);
            self.finalize_stream(id);
        } else {
            stream.pending_head = Some(fields);
            self.priority.wake(id);
        }
        self.wake_writer();
        Ok(())
    }

    /// Queue body bytes behind the stream's headers. With `end_stream` set
    /// the final DATA frame carries END_STREAM, avoiding a separate empty
    /// closing frame.
    pub(crate) fn write_body(
        &mut self,
        id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), Http2Error> {
        let stream = self
            .streams
            .get_mut(&id.value())
            .ok_or_else(|| closed_stream(id))?;
        if stream.reset.is_some() || stream.is_closed() {
            return Err(closed_stream(id));
        }
        if !stream.headers_sent && stream.pending_head.is_none() {
            return Err(Http2Error::stream(
                id,
                ErrorCode::InternalError,
                "body written before headers",
            ));
        }
        stream.queue_send(data);
        if end_stream {
            stream.end_after_send = true;
        }
        self.priority.wake(id);
        self.pump();
        Ok(())
    }

    /// Finish the body, optionally with trailers.
    pub(crate) fn end_body(
        &mut self,
        id: StreamId,
        trailers: Option<Vec<HeaderField>>,
    ) -> Result<(), Http2Error> {
        let stream = self
            .streams
            .get_mut(&id.value())
            .ok_or_else(|| closed_stream(id))?;
        if stream.reset.is_some() || stream.is_closed() {
            return Err(closed_stream(id));
        }
        stream.end_after_send = true;
        stream.pending_trailers = trailers;
        self.priority.wake(id);
        self.pump();
        Ok(())
    }

    /// Read the next chunk of a peer-sent body, releasing flow-control
    /// credit for what was consumed.
    pub(crate) fn read_body(&mut self, id: StreamId) -> Result<super::BodyRead, Http2Error> {
        let stream = self
            .streams
            .get_mut(&id.value())
            .ok_or_else(|| closed_stream(id))?;

        match stream.read_recv() {
            Some(chunk) => {
                let n = chunk.len();
                let finished = stream.recv_finished;
                if let Some(increment) = stream.flow.release(n) {
                    // Credit on a finished stream buys the peer nothing.
                    if !finished {
                        self.send_window_update(id, increment);
                    }
                }
                if let Some(increment) = self.conn_flow.release(n) {
                    self.send_window_update(StreamId::CONNECTION, increment);
                }
                self.wake_reader_if_actionable();
                Ok(super::BodyRead::Chunk(chunk))
            }
            None if stream.recv_finished => {
                if stream.is_closed() {
                    self.finalize_stream(id);
                }
                Ok(super::BodyRead::Finished)
            }
            None => Ok(super::BodyRead::Pending),
        }
    }

    /// Cancel a stream locally: RST_STREAM goes out, queued output is
    /// dropped, and the application sees a reset notification.
    pub(crate) fn reset_stream(&mut self, id: StreamId, code: ErrorCode) {
        self.reset_stream_with(id, code);
        self.pump();
    }

    /// Issue a PING; the ACK surfaces as [`CoreEvent::PingAck`].
    pub(crate) fn ping(&mut self, payload: [u8; 8]) {
        self.pings_in_flight.push_back(payload);
        self.send_frame(&Frame::Ping(PingFrame {
            ack: false,
            payload,
        }));
    }

    pub(crate) fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(&id.value()).map(|s| s.state())
    }

    /// Whether response headers for this stream were emitted or queued.
    pub(crate) fn headers_sent(&self, id: StreamId) -> bool {
        self.streams
            .get(&id.value())
            .map(|s| s.headers_sent || s.pending_head.is_some())
            .unwrap_or(false)
    }

    pub(crate) fn last_peer_stream_id(&self) -> StreamId {
        StreamId::new(self.last_peer_stream_id)
    }

    // -- internals ---------------------------------------------------------

    fn new_stream(&self, id: StreamId) -> Stream {
        Stream::new(
            id,
            self.settings.peer.initial_window_size,
            self.settings.acked.initial_window_size,
            self.config.request_body_buffer_size as u32,
        )
    }

    fn next_local_stream_id(&mut self) -> Result<u32, Http2Error> {
        let next = if self.last_local_stream_id == 0 {
            match self.role {
                Role::Client => 1,
                Role::Server => 2,
            }
        } else {
            self.last_local_stream_id + 2
        };
        if next > 0x7FFF_FFFF {
            return Err(Http2Error::connection(
                ErrorCode::RefusedStream,
                "stream ids exhausted",
            ));
        }
        self.last_local_stream_id = next;
        Ok(next)
    }

    fn is_peer_initiated(&self, id: StreamId) -> bool {
        match self.role {
            Role::Server => id.is_client_initiated(),
            Role::Client => id.is_server_initiated(),
        }
    }

    /// A stream id below the relevant high-water mark belonged to a stream
    /// that has since closed; frames for it are tolerated, not errors.
    fn is_recently_closed(&self, id: StreamId) -> bool {
        if self.is_peer_initiated(id) {
            id.value() <= self.last_peer_stream_id
        } else {
            id.value() <= self.last_local_stream_id
        }
    }

    fn active_peer_streams(&self) -> usize {
        self.streams
            .values()
            .filter(|s| s.is_active() && self.is_peer_initiated(s.id()))
            .count()
    }

    fn handle_error(&mut self, err: Http2Error) {
        match err {
            Http2Error::Stream { id, code, .. } => {
                self.reset_stream_with(id, code);
            }
            Http2Error::Connection { .. } => self.fatal(err),
        }
    }

    fn reset_stream_with(&mut self, id: StreamId, code: ErrorCode) {
        self.send_frame(&Frame::RstStream(RstStreamFrame {
            stream_id: id,
            error_code: code.to_u32(),
        }));
        if let Some(stream) = self.streams.get_mut(&id.value()) {
            stream.apply_reset(code);
        }
        self.finalize_stream(id);
        self.events.push_back(CoreEvent::StreamReset {
            stream_id: id,
            code,
        });
        self.wake_reader_if_actionable();
    }

    /// Connection-fatal error: GOAWAY with the peer's high-water stream id,
    /// then drain and close. Streams already in flight may still finish.
    fn fatal(&mut self, err: Http2Error) {
        if self.fatal.is_some() {
            return;
        }
        warn!(error = %err, "connection error");
        let reason = match &err {
            Http2Error::Connection { reason, .. } => reason.clone(),
            Http2Error::Stream { reason, .. } => reason.clone(),
        };
        self.send_goaway(err.code(), reason.as_bytes());
        self.events.push_back(CoreEvent::Error(err.clone()));
        self.fatal = Some(err);
        self.wake_writer();
        self.wake_reader_if_actionable();
    }

    fn send_goaway(&mut self, code: ErrorCode, debug_data: &[u8]) {
        self.send_frame(&Frame::GoAway(GoAwayFrame {
            last_stream_id: StreamId::new(self.last_peer_stream_id),
            error_code: code.to_u32(),
            debug_data: Bytes::copy_from_slice(debug_data),
        }));
        self.goaway_sent = Some(code);
    }

    fn send_window_update(&mut self, id: StreamId, increment: u32) {
        self.send_frame(&Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: id,
            increment,
        }));
    }

    fn send_frame(&mut self, frame: &Frame) {
        let mut buf = BytesMut::new();
        self.frame_encoder.encode(frame, &mut buf);
        self.out.push(buf.freeze());
        self.wake_writer();
    }

    fn encode_header_block(&mut self, id: StreamId, fields: &[HeaderField], end_stream: bool) {
        let mut block = Vec::with_capacity(self.config.response_buffer_size);
        self.hpack_tx.encode(fields, &mut block);
        let mut buf = BytesMut::new();
        self.frame_encoder
            .encode_header_block(id, &block, end_stream, None, &mut buf);
        self.out.push(buf.freeze());
    }

    /// Drop a stream from the active map once both directions are done.
    fn finalize_stream(&mut self, id: StreamId) {
        let done = self
            .streams
            .get(&id.value())
            .map(|s| s.is_closed() && s.recv_buffered() == 0)
            .unwrap_or(false);
        if done {
            self.streams.remove(&id.value());
            self.priority.retire(id);
            trace!(stream = %id, "stream finalized");
            if (self.shutdown_requested || self.read_eof) && self.streams.is_empty() {
                self.wake_writer();
            }
        }
    }

    /// The DATA scheduler: walk the priority tree and frame as much queued
    /// body as the windows allow, fairly across streams.
    fn pump(&mut self) {
        loop {
            let conn_open = self.conn_flow.send_available() > 0;
            let streams = &self.streams;
            let ready = |id: StreamId| -> bool {
                let Some(s) = streams.get(&id.value()) else {
                    return false;
                };
                if s.pending_head.is_some() {
                    return true;
                }
                if s.has_send_data() {
                    return conn_open && s.flow.send_available() > 0 && s.headers_sent;
                }
                s.end_after_send && s.headers_sent
            };
            let Some(id) = self.priority.select(&ready) else {
                break;
            };
            self.emit_for_stream(id);
        }
        if !self.out.is_empty() {
            self.wake_writer();
        }
    }

    /// Emit one frame's worth of output for a stream.
    fn emit_for_stream(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id.value()) else {
            return;
        };

        // Deferred response headers flush before any body.
        if let Some(fields) = stream.pending_head.take() {
            let end = stream.end_after_send
                && !stream.has_send_data()
                && stream.pending_trailers.is_none();
            // The transition cannot fail here: pending_head is only set on
            // streams that were writable at the time.
            if stream.send_headers(end).is_ok() {
                if end {
                    stream.end_after_send = false;
                }
                self.encode_header_block(id, &fields, end);
            }
            self.finalize_stream(id);
            return;
        }

        if stream.has_send_data() {
            let budget = stream
                .flow
                .send_available()
                .min(self.conn_flow.send_available())
                .min(self.frame_encoder.max_frame_size() as usize)
                .min(self.config.response_body_buffer_size.max(1));
            debug_assert!(budget > 0);
            let chunk = stream.take_sendable(budget);
            let end =
                stream.end_after_send && !stream.has_send_data() && stream.pending_trailers.is_none();

            stream.flow.debit_send(chunk.len());
            self.conn_flow.debit_send(chunk.len());
            self.priority.on_sent(id, chunk.len());

            if end {
                stream.send_end();
                stream.end_after_send = false;
            }
            self.send_frame(&Frame::Data(DataFrame {
                stream_id: id,
                end_stream: end,
                data: chunk,
                padding: 0,
            }));
            self.finalize_stream(id);
            return;
        }

        if stream.end_after_send {
            stream.end_after_send = false;
            if let Some(trailers) = stream.pending_trailers.take() {
                let _ = stream.send_headers(true);
                self.encode_header_block(id, &trailers, true);
            } else {
                stream.send_end();
                self.send_frame(&Frame::Data(DataFrame {
                    stream_id: id,
                    end_stream: true,
                    data: Bytes::new(),
                    padding: 0,
                }));
            }
            self.finalize_stream(id);
        }
    }
}

/// The uniform "this stream is gone" error for body-handle operations.
fn closed_stream(id: StreamId) -> Http2Error {
    Http2Error::stream(id, ErrorCode::StreamClosed, "stream is closed")
}
