//! Flow-control window accounting (RFC 7540 Section 6.9).

/// Largest legal window size: 2^31 - 1.
pub const MAX_WINDOW_SIZE: i32 = 0x7FFF_FFFF;

/// Flow-control accounting failure, reported as FLOW_CONTROL_ERROR. Whether
/// it kills a stream or the connection depends on which window overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// A WINDOW_UPDATE or SETTINGS adjustment would push the send window
    /// past 2^31 - 1.
    #[error("window increment overflows the maximum window size")]
    Overflow,
    /// The peer sent more octets than the advertised receive window.
    #[error("peer exceeded the advertised flow-control window")]
    Overrun,
}

/// A send/receive window pair, used for both individual streams and the
/// connection as a whole.
///
/// Windows are signed: a SETTINGS_INITIAL_WINDOW_SIZE reduction can push a
/// stream's send window below zero, in which case the stream stays blocked
/// until WINDOW_UPDATEs bring it positive again.
#[derive(Debug)]
pub struct FlowWindows {
    send: i32,
    recv: i32,
    /// Octets the application has consumed but we have not yet returned to
    /// the peer via WINDOW_UPDATE.
    released: u32,
    /// Minimum released octets before a WINDOW_UPDATE is worth emitting.
    update_threshold: u32,
}

impl FlowWindows {
    /// `send_initial` comes from the peer's settings, `recv_initial` from
    /// ours.
    pub fn new(send_initial: u32, recv_initial: u32, update_threshold: u32) -> Self {
        Self {
            send: send_initial as i32,
            recv: recv_initial as i32,
            released: 0,
            update_threshold,
        }
    }

    /// Octets we may still send. Zero while the window is negative.
    pub fn send_available(&self) -> usize {
        self.send.max(0) as usize
    }

    pub fn send_window(&self) -> i32 {
        self.send
    }

    pub fn recv_window(&self) -> i32 {
        self.recv
    }

    /// Account for `n` octets of DATA (payload plus padding) put on the wire.
    pub fn debit_send(&mut self, n: usize) {
        debug_assert!(n <= self.send_available());
        self.send -= n as i32;
    }

    /// Apply a WINDOW_UPDATE from the peer. Rejected, without mutating,
    /// when the result would exceed 2^31 - 1.
    pub fn credit_send(&mut self, increment: u32) -> Result<(), FlowError> {
        debug_assert!((1..=MAX_WINDOW_SIZE as u32).contains(&increment));
        let updated = i64::from(self.send) + i64::from(increment);
        if updated > i64::from(MAX_WINDOW_SIZE) {
            return Err(FlowError::Overflow);
        }
        self.send = updated as i32;
        Ok(())
    }

    /// Retroactive SETTINGS_INITIAL_WINDOW_SIZE adjustment. The delta may be
    /// negative; overflow past the maximum is still an error.
    pub fn adjust_send(&mut self, delta: i32) -> Result<(), FlowError> {
        let updated = i64::from(self.send) + i64::from(delta);
        if updated > i64::from(MAX_WINDOW_SIZE) {
            return Err(FlowError::Overflow);
        }
        self.send = updated as i32;
        Ok(())
    }

    /// Account for `n` octets of DATA received from the peer.
    pub fn debit_recv(&mut self, n: usize) -> Result<(), FlowError> {
        let updated = i64::from(self.recv) - n as i64;
        if updated < 0 {
            return Err(FlowError::Overrun);
        }
        self.recv = updated as i32;
        Ok(())
    }

    /// Retroactive adjustment of the receive window after our own
    /// SETTINGS_INITIAL_WINDOW_SIZE change is acknowledged.
    pub fn adjust_recv(&mut self, delta: i32) {
        self.recv = self.recv.saturating_add(delta);
    }

    /// The application consumed `n` octets from a body buffer. Returns the
    /// increment to put in a WINDOW_UPDATE once enough credit accumulates:
    /// at least the configured threshold, and at least half the current
    /// window, whichever is larger.
    pub fn release(&mut self, n: usize) -> Option<u32> {
        self.released = self.released.saturating_add(n as u32);
        let watermark = self.update_threshold.max(self.recv.max(0) as u32 / 2);
        if self.released >= watermark {
            let increment = self.released;
            self.released = 0;
            self.recv = self.recv.saturating_add(increment as i32).min(MAX_WINDOW_SIZE);
            Some(increment)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_accounting() {
        let mut fw = FlowWindows::new(65_535, 65_535, 4096);
        assert_eq!(fw.send_available(), 65_535);

        fw.debit_send(65_535);
        assert_eq!(fw.send_available(), 0);

        fw.credit_send(1000).unwrap();
        assert_eq!(fw.send_available(), 1000);
    }

    #[test]
    fn credit_overflow_rejected_without_mutation() {
        let mut fw = FlowWindows::new(MAX_WINDOW_SIZE as u32, 65_535, 4096);
        assert_eq!(fw.credit_send(1), Err(FlowError::Overflow));
        assert_eq!(fw.send_window(), MAX_WINDOW_SIZE);
    }

    #[test]
    fn settings_delta_can_go_negative() {
        let mut fw = FlowWindows::new(10, 65_535, 4096);
        fw.debit_send(10);
        fw.adjust_send(-5).unwrap();
        assert_eq!(fw.send_window(), -5);
        assert_eq!(fw.send_available(), 0);

        // Updates climb back out of the hole.
        fw.credit_send(8).unwrap();
        assert_eq!(fw.send_window(), 3);
        assert_eq!(fw.send_available(), 3);
    }

    #[test]
    fn adjust_overflow_rejected() {
        let mut fw = FlowWindows::new(MAX_WINDOW_SIZE as u32 - 1, 65_535, 4096);
        assert_eq!(fw.adjust_send(2), Err(FlowError::Overflow));
    }

    #[test]
    fn recv_overrun_detected() {
        let mut fw = FlowWindows::new(65_535, 100, 4096);
        fw.debit_recv(100).unwrap();
        assert_eq!(fw.debit_recv(1), Err(FlowError::Overrun));
    }

    #[test]
    fn release_waits_for_watermark() {
        let mut fw = FlowWindows::new(65_535, 65_535, 4096);
        fw.debit_recv(40_000).unwrap();
        // Window is 25_535; watermark is max(4096, 12_767) = 12_767.
        assert_eq!(fw.release(8_000), None);
        let increment = fw.release(8_000).unwrap();
        assert_eq!(increment, 16_000);
        assert_eq!(fw.recv_window(), 25_535 + 16_000);
    }

    #[test]
    fn release_threshold_floor_applies() {
        let mut fw = FlowWindows::new(65_535, 65_535, 4096);
        fw.debit_recv(65_000).unwrap();
        // Window is 535, half of it is tiny; the 4096 floor governs.
        assert_eq!(fw.release(2_000), None);
        assert_eq!(fw.release(2_000), None);
        assert!(fw.release(200).is_some());
    }
}
