#![no_main]

use h2_engine::{HpackDecoder, HpackEncoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = HpackDecoder::new();

    if let Ok(fields) = decoder.decode(data) {
        if fields.is_empty() {
            return;
        }

        // Whatever decodes must re-encode to an equivalent header list.
        // The representations may differ (indexing decisions are the
        // encoder's); names, values, and order may not.
        let mut encoder = HpackEncoder::new();
        let mut encoded = Vec::new();
        encoder.encode(&fields, &mut encoded);

        let mut verifier = HpackDecoder::new();
        let reparsed = verifier.decode(&encoded).expect("own output must decode");
        assert_eq!(fields.len(), reparsed.len(), "header count changed");
        for (a, b) in fields.iter().zip(reparsed.iter()) {
            assert_eq!(a.name, b.name, "name changed in roundtrip");
            assert_eq!(a.value, b.value, "value changed in roundtrip");
        }
    }
    // Malformed input is expected to fail; it must just not panic.
});
