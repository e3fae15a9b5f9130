//! Server-side HTTP/2 connection.
//!
//! The server expects the 24-octet client preface followed by SETTINGS,
//! surfaces each request as an event, and exposes response operations keyed
//! by stream id. All I/O goes through the read/write operation surface in
//! [`crate::io`].

use bytes::Bytes;
use tracing::debug;

use crate::frame::{ErrorCode, StreamId};
use crate::hpack::HeaderField;
use crate::io::{Continuation, ReadOperation, WriteOperation, WriteResult};

use super::core::{ConnectionCore, CoreEvent, Role};
use super::stream::{HeadersKind, StreamState};
use super::{
    parse_request_head, BodyRead, BodyReader, BodyWriter, Config, Http2Error, RequestHead,
    ResponseHead,
};

/// Events surfaced to the application driving a server connection.
#[derive(Debug)]
pub enum ServerEvent {
    /// Preface and SETTINGS exchange finished; requests may now arrive.
    Ready,
    /// A request header block arrived. Body bytes, if any, follow as
    /// [`ServerEvent::Data`] and are read through the [`BodyReader`].
    Request {
        stream_id: StreamId,
        request: RequestHead,
        body: BodyReader,
        end_stream: bool,
    },
    /// Request body bytes were deposited for `stream_id`.
    Data {
        stream_id: StreamId,
        end_stream: bool,
    },
    /// The request ended with a trailer block.
    Trailers {
        stream_id: StreamId,
        fields: Vec<HeaderField>,
    },
    /// The stream died (peer RST_STREAM or local reset).
    StreamReset {
        stream_id: StreamId,
        code: ErrorCode,
    },
    /// The client is going away.
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug_data: Bytes,
    },
    /// One of our PINGs came back; the caller owns round-trip timing.
    PingAck { payload: [u8; 8] },
    /// The peer acknowledged our SETTINGS.
    SettingsAcked,
    /// Connection-fatal error; GOAWAY is queued and the engine is draining.
    ConnectionError(Http2Error),
}

/// A server connection: one per accepted transport connection.
pub struct ServerConnection {
    core: ConnectionCore,
}

impl Default for ServerConnection {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl ServerConnection {
    pub fn new(config: Config) -> Self {
        Self {
            core: ConnectionCore::new(Role::Server, config),
        }
    }

    // -- I/O adapter surface ----------------------------------------------

    pub fn next_read_operation(&self) -> ReadOperation {
        self.core.next_read_operation()
    }

    /// Feed bytes received from the transport; returns the octets accepted.
    pub fn read(&mut self, data: &[u8]) -> usize {
        self.core.read(data)
    }

    /// Feed any final bytes and signal end-of-input.
    pub fn read_eof(&mut self, data: &[u8]) -> usize {
        self.core.read_eof(data)
    }

    pub fn yield_reader(&mut self, k: Continuation) {
        self.core.yield_reader(k);
    }

    pub fn next_write_operation(&mut self) -> WriteOperation {
        self.core.next_write_operation()
    }

    pub fn report_write_result(&mut self, result: WriteResult) {
        self.core.report_write_result(result);
    }

    pub fn yield_writer(&mut self, k: Continuation) {
        self.core.yield_writer(k);
    }

    /// The adapter hit an unrecoverable error; tear the connection down.
    pub fn report_exn(&mut self, reason: &str) {
        self.core.report_exn(reason);
    }

    /// Graceful shutdown: GOAWAY(NO_ERROR), finish in-flight streams,
    /// close after the queue drains.
    pub fn shutdown(&mut self) {
        self.core.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    // -- events ------------------------------------------------------------

    /// Drain pending events, translating protocol events into the request
    /// surface. Malformed requests are rejected here with a stream error.
    pub fn poll_events(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        for event in self.core.poll_events() {
            match event {
                CoreEvent::Ready => out.push(ServerEvent::Ready),
                CoreEvent::HeaderBlock {
                    stream_id,
                    fields,
                    end_stream,
                    kind: HeadersKind::Initial,
                } => match parse_request_head(fields) {
                    Ok(request) => out.push(ServerEvent::Request {
                        stream_id,
                        request,
                        body: BodyReader { id: stream_id },
                        end_stream,
                    }),
                    Err(reason) => {
                        debug!(stream = %stream_id, reason, "malformed request");
                        self.core.reset_stream(stream_id, ErrorCode::ProtocolError);
                    }
                },
                CoreEvent::HeaderBlock {
                    stream_id,
                    fields,
                    kind: HeadersKind::Trailers,
                    ..
                } => out.push(ServerEvent::Trailers { stream_id, fields }),
                CoreEvent::PushPromise { .. } => {
                    // The core rejects PUSH_PROMISE from clients before it
                    // can surface here.
                    debug_assert!(false, "push promise event on a server connection");
                }
                CoreEvent::Data {
                    stream_id,
                    end_stream,
                } => out.push(ServerEvent::Data {
                    stream_id,
                    end_stream,
                }),
                CoreEvent::StreamReset { stream_id, code } => {
                    out.push(ServerEvent::StreamReset { stream_id, code })
                }
                CoreEvent::GoAway {
                    last_stream_id,
                    code,
                    debug_data,
                } => out.push(ServerEvent::GoAway {
                    last_stream_id,
                    code,
                    debug_data,
                }),
                CoreEvent::PingAck { payload } => out.push(ServerEvent::PingAck { payload }),
                CoreEvent::SettingsAcked => out.push(ServerEvent::SettingsAcked),
                CoreEvent::Error(err) => out.push(ServerEvent::ConnectionError(err)),
            }
        }
        // Resets issued for malformed requests queue their own events.
        for event in self.core.poll_events() {
            if let CoreEvent::StreamReset { stream_id, code } = event {
                out.push(ServerEvent::StreamReset { stream_id, code });
            }
        }
        out
    }

    // -- response operations ------------------------------------------------

    /// Respond with a complete textual body.
    pub fn respond_with_string(
        &mut self,
        stream_id: StreamId,
        head: &ResponseHead,
        body: &str,
    ) -> Result<(), Http2Error> {
        self.respond_with_bigstring(stream_id, head, Bytes::copy_from_slice(body.as_bytes()))
    }

    /// Respond with a complete body without copying it.
    pub fn respond_with_bigstring(
        &mut self,
        stream_id: StreamId,
        head: &ResponseHead,
        body: Bytes,
    ) -> Result<(), Http2Error> {
        if body.is_empty() {
            self.core.send_headers(stream_id, head.to_fields(), true, true)
        } else {
            self.core
                .send_headers(stream_id, head.to_fields(), false, true)?;
            self.core.write_body(stream_id, body, true)
        }
    }

    /// Respond with a streamed body. With `flush_headers_immediately` unset,
    /// the header block rides with the first body bytes.
    pub fn respond_with_streaming(
        &mut self,
        stream_id: StreamId,
        head: &ResponseHead,
        flush_headers_immediately: bool,
    ) -> Result<BodyWriter, Http2Error> {
        self.core.send_headers(
            stream_id,
            head.to_fields(),
            false,
            flush_headers_immediately,
        )?;
        Ok(BodyWriter { id: stream_id })
    }

    /// Queue body bytes on a streaming response.
    pub fn write_body(&mut self, body: BodyWriter, data: impl Into<Bytes>) -> Result<(), Http2Error> {
        self.core.write_body(body.id, data.into(), false)
    }

    /// Finish a streaming response.
    pub fn end_body(&mut self, body: BodyWriter) -> Result<(), Http2Error> {
        self.core.end_body(body.id, None)
    }

    /// Finish a streaming response with a trailer block.
    pub fn end_body_with_trailers(
        &mut self,
        body: BodyWriter,
        trailers: Vec<HeaderField>,
    ) -> Result<(), Http2Error> {
        self.core.end_body(body.id, Some(trailers))
    }

    /// Read the next chunk of a request body, releasing flow-control credit
    /// to the client for the consumed bytes.
    pub fn read_body(&mut self, body: BodyReader) -> Result<BodyRead, Http2Error> {
        self.core.read_body(body.id)
    }

    /// Promise a pushed response on `parent`. Returns the promised stream,
    /// which must then be completed with the response operations above.
    pub fn push(
        &mut self,
        parent: StreamId,
        request: &RequestHead,
    ) -> Result<(StreamId, BodyWriter), Http2Error> {
        let promised = self.core.push_promise(parent, request.to_fields())?;
        Ok((promised, BodyWriter { id: promised }))
    }

    /// Cancel a stream with the given error code.
    pub fn reset_stream(&mut self, stream_id: StreamId, code: ErrorCode) {
        self.core.reset_stream(stream_id, code);
    }

    /// The application's handler failed for this stream: answer 500 if the
    /// response headers have not gone out yet, otherwise reset the stream
    /// with INTERNAL_ERROR.
    pub fn report_handler_error(&mut self, stream_id: StreamId) {
        if self.core.headers_sent(stream_id) {
            self.core.reset_stream(stream_id, ErrorCode::InternalError);
        } else {
            let head = ResponseHead::new(500);
            let _ = self.respond_with_string(stream_id, &head, "");
        }
    }

    /// Issue a PING; the ACK surfaces as [`ServerEvent::PingAck`].
    pub fn ping(&mut self, payload: [u8; 8]) {
        self.core.ping(payload);
    }

    /// Current state of a stream, if it is still tracked.
    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.core.stream_state(stream_id)
    }

    /// Highest client stream id accepted so far.
    pub fn last_peer_stream_id(&self) -> StreamId {
        self.core.last_peer_stream_id()
    }
}
