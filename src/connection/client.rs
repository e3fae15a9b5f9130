//! Client-side HTTP/2 connection: the symmetric mirror of the server.
//!
//! The client transmits the connection preface and its SETTINGS at
//! construction, initiates odd-numbered streams with `request`, and
//! surfaces responses (and pushed requests, when push is enabled) as
//! events.

use bytes::Bytes;
use tracing::debug;

use crate::frame::{ErrorCode, StreamId};
use crate::hpack::HeaderField;
use crate::io::{Continuation, ReadOperation, WriteOperation, WriteResult};

use super::core::{ConnectionCore, CoreEvent, Role};
use super::stream::{HeadersKind, StreamState};
use super::{
    parse_request_head, parse_response_head, BodyRead, BodyReader, BodyWriter, Config, Http2Error,
    RequestHead, ResponseHead,
};

/// Events surfaced to the application driving a client connection.
#[derive(Debug)]
pub enum ClientEvent {
    /// SETTINGS exchange finished.
    Ready,
    /// A response header block arrived for a stream we initiated.
    Response {
        stream_id: StreamId,
        response: ResponseHead,
        body: BodyReader,
        end_stream: bool,
    },
    /// Response body bytes were deposited for `stream_id`.
    Data {
        stream_id: StreamId,
        end_stream: bool,
    },
    /// The response ended with a trailer block.
    Trailers {
        stream_id: StreamId,
        fields: Vec<HeaderField>,
    },
    /// The server promised a pushed response for `request`.
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        request: RequestHead,
    },
    /// The stream died (peer RST_STREAM or local reset).
    StreamReset {
        stream_id: StreamId,
        code: ErrorCode,
    },
    /// The server is going away; streams above `last_stream_id` were not
    /// processed and are reported reset with REFUSED_STREAM.
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug_data: Bytes,
    },
    /// One of our PINGs came back; the caller owns round-trip timing.
    PingAck { payload: [u8; 8] },
    /// The server acknowledged our SETTINGS.
    SettingsAcked,
    /// Connection-fatal error; GOAWAY is queued and the engine is draining.
    ConnectionError(Http2Error),
}

/// A client connection: one per transport connection to a server.
pub struct ClientConnection {
    core: ConnectionCore,
}

impl Default for ClientConnection {
    fn default() -> Self {
        // Clients refuse server push unless explicitly enabled.
        Self::new(Config::default().enable_server_push(false))
    }
}

impl ClientConnection {
    pub fn new(config: Config) -> Self {
        Self {
            core: ConnectionCore::new(Role::Client, config),
        }
    }

    // -- I/O adapter surface ----------------------------------------------

    pub fn next_read_operation(&self) -> ReadOperation {
        self.core.next_read_operation()
    }

    pub fn read(&mut self, data: &[u8]) -> usize {
        self.core.read(data)
    }

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

    pub fn report_exn(&mut self, reason: &str) {
        self.core.report_exn(reason);
    }

    pub fn shutdown(&mut self) {
        self.core.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    // -- requests ----------------------------------------------------------

    /// Start a request. With `end_stream` unset the returned writer feeds
    /// the request body.
    pub fn request(
        &mut self,
        request: &RequestHead,
        end_stream: bool,
    ) -> Result<(StreamId, BodyWriter), Http2Error> {
        let id = self.core.open_stream(request.to_fields(), end_stream)?;
        Ok((id, BodyWriter { id }))
    }

    pub fn write_body(&mut self, body: BodyWriter, data: impl Into<Bytes>) -> Result<(), Http2Error> {
        self.core.write_body(body.id, data.into(), false)
    }

    pub fn end_body(&mut self, body: BodyWriter) -> Result<(), Http2Error> {
        self.core.end_body(body.id, None)
    }

    pub fn end_body_with_trailers(
        &mut self,
        body: BodyWriter,
        trailers: Vec<HeaderField>,
    ) -> Result<(), Http2Error> {
        self.core.end_body(body.id, Some(trailers))
    }

    /// Read the next chunk of a response body, releasing flow-control
    /// credit to the server for the consumed bytes.
    pub fn read_body(&mut self, body: BodyReader) -> Result<BodyRead, Http2Error> {
        self.core.read_body(body.id)
    }

    /// Cancel a stream.
    pub fn reset_stream(&mut self, stream_id: StreamId, code: ErrorCode) {
        self.core.reset_stream(stream_id, code);
    }

    /// Issue a PING; the ACK surfaces as [`ClientEvent::PingAck`].
    pub fn ping(&mut self, payload: [u8; 8]) {
        self.core.ping(payload);
    }

    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.core.stream_state(stream_id)
    }

    // -- events ------------------------------------------------------------

    /// Drain pending events, translating header blocks into responses.
    pub fn poll_events(&mut self) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        for event in self.core.poll_events() {
            match event {
                CoreEvent::Ready => out.push(ClientEvent::Ready),
                CoreEvent::HeaderBlock {
                    stream_id,
                    fields,
                    end_stream,
                    kind: HeadersKind::Initial,
                } => match parse_response_head(fields) {
                    Ok(response) => out.push(ClientEvent::Response {
                        stream_id,
                        response,
                        body: BodyReader { id: stream_id },
                        end_stream,
                    }),
                    Err(reason) => {
                        debug!(stream = %stream_id, reason, "malformed response");
                        self.core.reset_stream(stream_id, ErrorCode::ProtocolError);
                    }
                },
                CoreEvent::HeaderBlock {
                    stream_id,
                    fields,
                    kind: HeadersKind::Trailers,
                    ..
                } => out.push(ClientEvent::Trailers { stream_id, fields }),
                CoreEvent::PushPromise {
                    stream_id,
                    promised_stream_id,
                    fields,
                } => match parse_request_head(fields) {
                    Ok(request) => out.push(ClientEvent::PushPromise {
                        stream_id,
                        promised_stream_id,
                        request,
                    }),
                    Err(reason) => {
                        debug!(stream = %promised_stream_id, reason, "malformed pushed request");
                        self.core
                            .reset_stream(promised_stream_id, ErrorCode::ProtocolError);
                    }
                },
                CoreEvent::Data {
                    stream_id,
                    end_stream,
                } => out.push(ClientEvent::Data {
                    stream_id,
                    end_stream,
                }),
                CoreEvent::StreamReset { stream_id, code } => {
                    out.push(ClientEvent::StreamReset { stream_id, code })
                }
                CoreEvent::GoAway {
                    last_stream_id,
                    code,
                    debug_data,
                } => out.push(ClientEvent::GoAway {
                    last_stream_id,
                    code,
                    debug_data,
                }),
                CoreEvent::PingAck { payload } => out.push(ClientEvent::PingAck { payload }),
                CoreEvent::SettingsAcked => out.push(ClientEvent::SettingsAcked),
                CoreEvent::Error(err) => out.push(ClientEvent::ConnectionError(err)),
            }
        }
        for event in self.core.poll_events() {
            if let CoreEvent::StreamReset { stream_id, code } = event {
                out.push(ClientEvent::StreamReset { stream_id, code });
            }
        }
        out
    }
}
