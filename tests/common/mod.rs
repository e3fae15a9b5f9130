//! Shared helpers: raw frame builders (independent of the crate's encoder)
//! and drivers that move bytes between a connection and the test.
#![allow(dead_code)]

use h2_engine::{
    ClientConnection, ServerConnection, WriteOperation, WriteResult, CONNECTION_PREFACE,
};

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const END_STREAM: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;

/// A frame pulled back apart for assertions.
#[derive(Debug)]
pub struct RawFrame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

pub fn parse_frames(mut data: &[u8]) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    while data.len() >= 9 {
        let length =
            ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize;
        assert!(data.len() >= 9 + length, "truncated frame in output");
        frames.push(RawFrame {
            frame_type: data[3],
            flags: data[4],
            stream_id: u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & 0x7FFF_FFFF,
            payload: data[9..9 + length].to_vec(),
        });
        data = &data[9 + length..];
    }
    assert!(data.is_empty(), "trailing partial frame in output");
    frames
}

pub fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + payload.len());
    out.extend_from_slice(&[
        (payload.len() >> 16) as u8,
        (payload.len() >> 8) as u8,
        payload.len() as u8,
        frame_type,
        flags,
    ]);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn settings(pairs: &[(u16, u32)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (id, value) in pairs {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    frame(FRAME_SETTINGS, 0, 0, &payload)
}

pub fn settings_ack() -> Vec<u8> {
    frame(FRAME_SETTINGS, 0x1, 0, &[])
}

pub fn headers(stream_id: u32, flags: u8, block: &[u8]) -> Vec<u8> {
    frame(FRAME_HEADERS, flags, stream_id, block)
}

pub fn data(stream_id: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    frame(FRAME_DATA, flags, stream_id, payload)
}

pub fn window_update(stream_id: u32, increment: u32) -> Vec<u8> {
    frame(FRAME_WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes())
}

pub fn ping(flags: u8, payload: [u8; 8]) -> Vec<u8> {
    frame(FRAME_PING, flags, 0, &payload)
}

pub fn rst_stream(stream_id: u32, code: u32) -> Vec<u8> {
    frame(FRAME_RST_STREAM, 0, stream_id, &code.to_be_bytes())
}

/// A minimal GET request block built from static-table references plus a
/// one-octet `:authority` literal:
/// `:method GET`, `:scheme https`, `:path /`, `:authority x`.
pub fn small_get_block() -> Vec<u8> {
    vec![0x82, 0x87, 0x84, 0x01, 0x01, b'x']
}

/// Pull everything the server has scheduled, reporting it fully flushed.
pub fn drain_server(conn: &mut ServerConnection) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match conn.next_write_operation() {
            WriteOperation::Write(slices) => {
                let total: usize = slices.iter().map(|s| s.len()).sum();
                for slice in slices {
                    out.extend_from_slice(&slice);
                }
                conn.report_write_result(WriteResult::Written(total));
            }
            WriteOperation::Yield | WriteOperation::Close(_) => return out,
        }
    }
}

pub fn drain_client(conn: &mut ClientConnection) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match conn.next_write_operation() {
            WriteOperation::Write(slices) => {
                let total: usize = slices.iter().map(|s| s.len()).sum();
                for slice in slices {
                    out.extend_from_slice(&slice);
                }
                conn.report_write_result(WriteResult::Written(total));
            }
            WriteOperation::Yield | WriteOperation::Close(_) => return out,
        }
    }
}

/// Run the client handshake against a fresh server with the given client
/// settings, returning the server's handshake output (its SETTINGS and the
/// ACK of ours).
pub fn handshake(conn: &mut ServerConnection, client_settings: &[(u16, u32)]) -> Vec<u8> {
    let mut bytes = CONNECTION_PREFACE.to_vec();
    bytes.extend_from_slice(&settings(client_settings));
    conn.read(&bytes);
    drain_server(conn)
}

/// Shuttle bytes between a client and a server until both go quiet.
pub fn shuttle(client: &mut ClientConnection, server: &mut ServerConnection) {
    for _ in 0..32 {
        let from_client = drain_client(client);
        let from_server = drain_server(server);
        if from_client.is_empty() && from_server.is_empty() {
            return;
        }
        if !from_client.is_empty() {
            server.read(&from_client);
        }
        if !from_server.is_empty() {
            client.read(&from_server);
        }
    }
    panic!("client/server exchange did not settle");
}
