#![no_main]

use bytes::BytesMut;
use h2_engine::{Frame, FrameDecoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let decoder = FrameDecoder::new();
    let mut buf = BytesMut::from(data);

    // Decode frames until the input runs dry or turns out malformed.
    loop {
        match decoder.decode(&mut buf) {
            Ok(Some(frame)) => {
                let _ = frame.stream_id();

                match frame {
                    Frame::Data(f) => {
                        assert!(f.data.len() + f.padding as usize <= data.len());
                    }
                    Frame::Headers(f) => {
                        if let Some(priority) = f.priority {
                            assert!((1..=256).contains(&priority.weight));
                            assert_ne!(priority.dependency, f.stream_id);
                        }
                    }
                    Frame::Priority(f) => {
                        assert!((1..=256).contains(&f.priority.weight));
                    }
                    Frame::WindowUpdate(f) => {
                        assert!((1..=0x7FFF_FFFF).contains(&f.increment));
                    }
                    Frame::Ping(f) => {
                        let _ = f.payload;
                    }
                    Frame::Settings(f) => {
                        assert!(!f.ack || f.settings.is_empty());
                    }
                    _ => {}
                }
            }
            // Incomplete input or a parse error; both are fine.
            Ok(None) | Err(_) => break,
        }
    }
});
