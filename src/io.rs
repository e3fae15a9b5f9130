//! The byte-oriented surface between the engine and its I/O adapter.
//!
//! The engine never touches a socket. The adapter asks what to do next via
//! `next_read_operation` / `next_write_operation` on a connection, performs
//! the I/O itself, and reports results back. `Yield` means "nothing to do
//! until something changes"; the adapter may park a continuation with
//! `yield_reader` / `yield_writer` to be invoked at that point.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// What the reading side of the adapter should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOperation {
    /// Read from the peer and feed the bytes to `read` / `read_eof`.
    Read,
    /// No appetite for input right now.
    Yield,
    /// The receive direction is finished; stop reading.
    Close,
}

/// What the writing side of the adapter should do next.
#[derive(Debug, Clone)]
pub enum WriteOperation {
    /// Write these owned slices, in order, and report the octet count
    /// actually flushed via `report_write_result`.
    Write(Vec<Bytes>),
    /// Nothing to transmit right now.
    Yield,
    /// Shutdown is complete and every queued octet was flushed; the value
    /// is the total number of octets this connection wrote.
    Close(u64),
}

/// Adapter's report after attempting a `WriteOperation::Write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// `n` octets were flushed; the rest stay queued.
    Written(usize),
    /// The transport is gone.
    Closed,
}

/// A continuation parked by the adapter, resumed when the direction it
/// waits on becomes actionable again.
pub type Continuation = Box<dyn FnOnce() + Send>;

/// Outbound byte segments scheduled for the transport.
///
/// Segments are owned `Bytes` so a partially flushed writev can simply slide
/// forward without copying.
#[derive(Debug, Default)]
pub struct WriteQueue {
    segments: VecDeque<Bytes>,
    queued: usize,
    flushed: u64,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: Bytes) {
        if !segment.is_empty() {
            self.queued += segment.len();
            self.segments.push_back(segment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Octets currently waiting for the transport.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Total octets ever handed to the transport.
    pub fn total_flushed(&self) -> u64 {
        self.flushed
    }

    /// The slices to pass to the next writev. Cloning `Bytes` is a
    /// refcount bump, not a copy.
    pub fn slices(&self) -> Vec<Bytes> {
        self.segments.iter().cloned().collect()
    }

    /// Drop `n` flushed octets from the front of the queue.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.queued);
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.segments.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
        self.queued -= n;
        self.flushed += n as u64;
    }

    /// Drop everything still queued (connection abort).
    pub fn clear(&mut self) {
        self.segments.clear();
        self.queued = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_skips_empty_segments() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::new());
        assert!(queue.is_empty());
        queue.push(Bytes::from_static(b"abc"));
        assert_eq!(queue.queued(), 3);
    }

    #[test]
    fn consume_across_segment_boundaries() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"hello"));
        queue.push(Bytes::from_static(b"world"));
        assert_eq!(queue.queued(), 10);

        queue.consume(7);
        assert_eq!(queue.queued(), 3);
        let slices = queue.slices();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].as_ref(), b"rld");

        queue.consume(3);
        assert!(queue.is_empty());
        assert_eq!(queue.total_flushed(), 10);
    }

    #[test]
    fn partial_consume_within_one_segment() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"abcdef"));
        queue.consume(2);
        assert_eq!(queue.slices()[0].as_ref(), b"cdef");
        assert_eq!(queue.total_flushed(), 2);
    }

    #[test]
    fn clear_resets_queue_but_not_flush_count() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"abc"));
        queue.consume(1);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.queued(), 0);
        assert_eq!(queue.total_flushed(), 1);
    }
}
