//! h2-engine - a sans-io HTTP/2 protocol engine.
//!
//! This crate implements the protocol core of an HTTP/2 endpoint: frame
//! parsing and serialization, HPACK header compression, per-stream state
//! machines, flow control in both directions, and priority-aware DATA
//! scheduling. It performs no I/O: the caller feeds received bytes in,
//! pulls scheduled output out, and reacts to events.
//!
//! # Architecture
//!
//! - [`frame`]: frame types, decoding, and encoding (RFC 7540 Section 4)
//! - [`hpack`]: header compression (RFC 7541), including Huffman coding
//! - [`connection`]: the connection and stream state machines
//! - [`priority`]: the weighted dependency tree driving DATA scheduling
//! - [`flow`]: flow-control window accounting
//! - [`io`]: the read/write operation surface the I/O adapter drives
//!
//! Sockets, TLS, ALPN, and timers are external collaborators. The engine is
//! single-threaded and cooperative: every state change happens inside a
//! call from the adapter or the application.
//!
//! # Driving a server
//!
//! ```no_run
//! use h2_engine::{Config, ReadOperation, ServerConnection, ServerEvent, ResponseHead};
//!
//! let mut conn = ServerConnection::new(Config::default());
//! loop {
//!     if let ReadOperation::Read = conn.next_read_operation() {
//!         let received: &[u8] = unimplemented!("read from the socket");
//!         conn.read(received);
//!     }
//!     for event in conn.poll_events() {
//!         if let ServerEvent::Request { stream_id, .. } = event {
//!             let head = ResponseHead::new(200);
//!             conn.respond_with_string(stream_id, &head, "hello").unwrap();
//!         }
//!     }
//!     // drive conn.next_write_operation() / conn.report_write_result()
//! }
//! ```

pub mod connection;
pub mod flow;
pub mod frame;
pub mod hpack;
pub mod io;
pub mod priority;

pub use connection::{
    BodyRead, BodyReader, BodyWriter, ClientConnection, ClientEvent, Config, Http2Error,
    RequestHead, ResponseHead, ServerConnection, ServerEvent,
};
pub use frame::{ErrorCode, Frame, FrameDecoder, FrameEncoder, StreamId, CONNECTION_PREFACE};
pub use hpack::{HeaderField, HpackDecoder, HpackEncoder};
pub use io::{ReadOperation, WriteOperation, WriteResult};
