//! SETTINGS bookkeeping (RFC 7540 Section 6.5).

use std::collections::VecDeque;

use crate::frame::{Setting, SettingId, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_FRAME_SIZE};

/// The six protocol parameters, with RFC defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// Unlimited per RFC; this implementation caps at 2^31 - 1.
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// `None` means unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: 0x7FFF_FFFF,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// The identifier/value pairs to put on the wire: everything that
    /// differs from the protocol defaults.
    pub fn to_wire(&self) -> Vec<Setting> {
        let defaults = Settings::default();
        let mut out = Vec::new();
        if self.header_table_size != defaults.header_table_size {
            out.push(Setting {
                id: SettingId::HeaderTableSize,
                value: self.header_table_size,
            });
        }
        if self.enable_push != defaults.enable_push {
            out.push(Setting {
                id: SettingId::EnablePush,
                value: self.enable_push as u32,
            });
        }
        if self.max_concurrent_streams != defaults.max_concurrent_streams {
            out.push(Setting {
                id: SettingId::MaxConcurrentStreams,
                value: self.max_concurrent_streams,
            });
        }
        if self.initial_window_size != defaults.initial_window_size {
            out.push(Setting {
                id: SettingId::InitialWindowSize,
                value: self.initial_window_size,
            });
        }
        if self.max_frame_size != defaults.max_frame_size {
            out.push(Setting {
                id: SettingId::MaxFrameSize,
                value: self.max_frame_size,
            });
        }
        if let Some(limit) = self.max_header_list_size {
            out.push(Setting {
                id: SettingId::MaxHeaderListSize,
                value: limit,
            });
        }
        out
    }

    /// Fold a received identifier/value pair in. Values were already
    /// range-checked by the frame decoder; unknown identifiers are ignored.
    pub fn apply(&mut self, setting: Setting) {
        match setting.id {
            SettingId::HeaderTableSize => self.header_table_size = setting.value,
            SettingId::EnablePush => self.enable_push = setting.value == 1,
            SettingId::MaxConcurrentStreams => self.max_concurrent_streams = setting.value,
            SettingId::InitialWindowSize => self.initial_window_size = setting.value,
            SettingId::MaxFrameSize => self.max_frame_size = setting.value,
            SettingId::MaxHeaderListSize => self.max_header_list_size = Some(setting.value),
            SettingId::Unknown(_) => {}
        }
    }
}

/// Both endpoints' settings plus the un-acknowledged local queue.
///
/// A locally sent SETTINGS takes effect only once the peer acknowledges it,
/// so `sent` holds every frame still in flight, oldest first; each ACK
/// promotes the front of the queue into `acked`.
#[derive(Debug, Default)]
pub struct SettingsState {
    /// Local values the peer has acknowledged.
    pub acked: Settings,
    /// Local values sent but not yet acknowledged.
    pub sent: VecDeque<Settings>,
    /// The peer's current values.
    pub peer: Settings,
}

impl SettingsState {
    pub fn new(initial_local: Settings) -> Self {
        Self {
            // Until our first SETTINGS is acknowledged, the protocol
            // defaults govern what the peer may send us.
            acked: Settings::default(),
            sent: VecDeque::from([initial_local]),
            peer: Settings::default(),
        }
    }

    /// Record an outgoing (non-ACK) SETTINGS frame.
    pub fn record_sent(&mut self, settings: Settings) {
        self.sent.push_back(settings);
    }

    /// The peer acknowledged our oldest in-flight SETTINGS. Returns the
    /// newly effective local settings, or `None` for a spurious ACK.
    pub fn on_ack(&mut self) -> Option<Settings> {
        let acked = self.sent.pop_front()?;
        self.acked = acked;
        Some(acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_rfc() {
        let s = Settings::default();
        assert_eq!(s.header_table_size, 4096);
        assert!(s.enable_push);
        assert_eq!(s.max_concurrent_streams, 0x7FFF_FFFF);
        assert_eq!(s.initial_window_size, 65_535);
        assert_eq!(s.max_frame_size, 16_384);
        assert_eq!(s.max_header_list_size, None);
    }

    #[test]
    fn wire_form_omits_defaults() {
        assert!(Settings::default().to_wire().is_empty());

        let custom = Settings {
            enable_push: false,
            max_concurrent_streams: 128,
            ..Settings::default()
        };
        let wire = custom.to_wire();
        assert_eq!(wire.len(), 2);
        assert!(wire.iter().any(|s| s.id == SettingId::EnablePush && s.value == 0));
        assert!(
            wire.iter()
                .any(|s| s.id == SettingId::MaxConcurrentStreams && s.value == 128)
        );
    }

    #[test]
    fn apply_updates_fields() {
        let mut s = Settings::default();
        s.apply(Setting {
            id: SettingId::InitialWindowSize,
            value: 10,
        });
        assert_eq!(s.initial_window_size, 10);
        s.apply(Setting {
            id: SettingId::Unknown(0x42),
            value: 7,
        });
        assert_eq!(s, Settings {
            initial_window_size: 10,
            ..Settings::default()
        });
    }

    #[test]
    fn ack_promotes_in_flight_settings() {
        let local = Settings {
            max_concurrent_streams: 32,
            ..Settings::default()
        };
        let mut state = SettingsState::new(local);
        assert_eq!(state.acked, Settings::default());

        let effective = state.on_ack().unwrap();
        assert_eq!(effective.max_concurrent_streams, 32);
        assert_eq!(state.acked.max_concurrent_streams, 32);

        // A second ACK with nothing in flight is spurious.
        assert!(state.on_ack().is_none());
    }

    #[test]
    fn acks_resolve_in_send_order() {
        let first = Settings {
            initial_window_size: 100,
            ..Settings::default()
        };
        let second = Settings {
            initial_window_size: 200,
            ..Settings::default()
        };
        let mut state = SettingsState::new(first);
        state.record_sent(second);

        assert_eq!(state.on_ack().unwrap().initial_window_size, 100);
        assert_eq!(state.on_ack().unwrap().initial_window_size, 200);
    }
}
