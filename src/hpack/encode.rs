//! HPACK header block encoding (RFC 7541 Section 3).

use std::collections::HashMap;

use tracing::trace;

use super::huffman;
use super::table::{DynamicTable, HeaderField, StaticTable};

/// Header names whose values are too volatile or too revealing to be worth a
/// dynamic-table slot; always emitted as literals without indexing.
const NEVER_INDEX_VALUE: &[&[u8]] = &[
    b":path",
    b"age",
    b"content-length",
    b"etag",
    b"if-modified-since",
    b"if-none-match",
    b"location",
    b"set-cookie",
];

/// Encodes header blocks, maintaining the connection's outbound dynamic
/// table and a reverse lookup from field to table position.
///
/// The reverse lookup stores insertion sequence numbers rather than indices:
/// a live entry's wire index is recomputed from its sequence on each use, so
/// insertions never invalidate the map.
pub struct HpackEncoder {
    table: DynamicTable,
    /// name -> value -> insertion sequence of the newest copy.
    lookup: HashMap<Vec<u8>, HashMap<Vec<u8>, u64>>,
    /// Capacity to announce at the start of the next header block, set when
    /// the peer changes SETTINGS_HEADER_TABLE_SIZE.
    pending_capacity: Option<usize>,
    use_huffman: bool,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self::with_capacity(super::DEFAULT_TABLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: DynamicTable::new(capacity),
            lookup: HashMap::new(),
            pending_capacity: None,
            use_huffman: true,
        }
    }

    /// Disable Huffman string coding (useful for byte-predictable tests).
    pub fn set_huffman(&mut self, enabled: bool) {
        self.use_huffman = enabled;
    }

    /// Apply a peer-mandated table capacity. Eviction happens now; the
    /// size-update prefix is emitted before the next header block so the
    /// remote decoder stays in sync.
    pub fn set_capacity(&mut self, capacity: usize) {
        trace!(capacity, "hpack encoder capacity change");
        let evicted = self.table.set_capacity(capacity);
        self.forget(&evicted);
        self.pending_capacity = Some(capacity);
    }

    #[cfg(test)]
    pub(crate) fn table_len(&self) -> usize {
        self.table.len()
    }

    /// Encode a header list into `out` as one header block.
    pub fn encode(&mut self, fields: &[HeaderField], out: &mut Vec<u8>) {
        if let Some(capacity) = self.pending_capacity.take() {
            encode_integer(capacity, 5, 0x20, out);
        }
        for field in fields {
            self.encode_field(field, out);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, out: &mut Vec<u8>) {
        let statik = StaticTable::find(&field.name, &field.value);

        // Sensitive fields never touch either table's value space.
        if field.sensitive || sensitive_by_policy(field) {
            let name_index = match statik {
                Some((index, _)) => Some(index),
                None => self.live_name_index(&field.name),
            };
            self.encode_literal(name_index, field, 4, 0x10, out);
            return;
        }

        if let Some((index, true)) = statik {
            encode_integer(index, 7, 0x80, out);
            return;
        }

        if let Some(index) = self.live_field_index(&field.name, &field.value) {
            encode_integer(index, 7, 0x80, out);
            return;
        }

        let name_index = match statik {
            Some((index, false)) => Some(index),
            _ => self.live_name_index(&field.name),
        };

        if NEVER_INDEX_VALUE.contains(&field.name.as_slice()) {
            self.encode_literal(name_index, field, 4, 0x00, out);
            return;
        }

        self.encode_literal(name_index, field, 6, 0x40, out);
        self.remember(field.clone());
    }

    /// Emit a literal representation with the given prefix. `name_index`
    /// selects name-by-reference; otherwise the name is written as a string.
    fn encode_literal(
        &self,
        name_index: Option<usize>,
        field: &HeaderField,
        prefix_bits: u8,
        prefix: u8,
        out: &mut Vec<u8>,
    ) {
        match name_index {
            Some(index) => encode_integer(index, prefix_bits, prefix, out),
            None => {
                out.push(prefix);
                self.encode_string(&field.name, out);
            }
        }
        self.encode_string(&field.value, out);
    }

    /// Length-prefixed string, Huffman-coded when that is strictly shorter.
    fn encode_string(&self, data: &[u8], out: &mut Vec<u8>) {
        if self.use_huffman {
            let coded = huffman::encoded_len(data);
            if coded < data.len() {
                encode_integer(coded, 7, 0x80, out);
                huffman::encode(data, out);
                return;
            }
        }
        encode_integer(data.len(), 7, 0x00, out);
        out.extend_from_slice(data);
    }

    /// Insert into the dynamic table and the reverse lookup, dropping
    /// lookup entries whose table copies were evicted to make room.
    fn remember(&mut self, field: HeaderField) {
        let (name, value) = (field.name.clone(), field.value.clone());
        let (seq, evicted) = self.table.insert(field);
        self.forget(&evicted);
        if self.table.index_of_sequence(seq).is_some() {
            self.lookup.entry(name).or_default().insert(value, seq);
        }
    }

    fn forget(&mut self, evicted: &[HeaderField]) {
        for field in evicted {
            let remove_name = if let Some(values) = self.lookup.get_mut(&field.name) {
                // Only drop the mapping if the evicted copy was the one the
                // map points at; a newer duplicate may still be live.
                let stale = values
                    .get(&field.value)
                    .is_some_and(|&seq| self.table.index_of_sequence(seq).is_none());
                if stale {
                    values.remove(&field.value);
                }
                values.is_empty()
            } else {
                false
            };
            if remove_name {
                self.lookup.remove(&field.name);
            }
        }
    }

    /// Wire index of a live exact match in the dynamic table.
    fn live_field_index(&self, name: &[u8], value: &[u8]) -> Option<usize> {
        let seq = *self.lookup.get(name)?.get(value)?;
        self.table
            .index_of_sequence(seq)
            .map(|i| StaticTable::LEN + i)
    }

    /// Wire index of any live entry sharing the name.
    fn live_name_index(&self, name: &[u8]) -> Option<usize> {
        let values = self.lookup.get(name)?;
        values
            .values()
            .filter_map(|&seq| self.table.index_of_sequence(seq))
            .min()
            .map(|i| StaticTable::LEN + i)
    }
}

/// Headers that are sensitive regardless of how the caller tagged them.
fn sensitive_by_policy(field: &HeaderField) -> bool {
    field.name == b"authorization" || (field.name == b"cookie" && field.value.len() < 20)
}

/// Encode an N-bit-prefix integer (RFC 7541 Section 5.1).
fn encode_integer(mut value: usize, prefix_bits: u8, prefix: u8, out: &mut Vec<u8>) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.push(prefix | value as u8);
        return;
    }
    out.push(prefix | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::super::decode::HpackDecoder;
    use super::*;

    fn roundtrip(encoder: &mut HpackEncoder, fields: &[HeaderField]) -> Vec<u8> {
        let mut out = Vec::new();
        encoder.encode(fields, &mut out);
        let mut decoder = HpackDecoder::new();
        let decoded = decoder.decode(&out).unwrap();
        assert_eq!(decoded, fields);
        out
    }

    #[test]
    fn integer_rfc_examples() {
        let mut out = Vec::new();
        encode_integer(10, 5, 0x00, &mut out);
        assert_eq!(out, [0x0a]);

        let mut out = Vec::new();
        encode_integer(1337, 5, 0x00, &mut out);
        assert_eq!(out, [0x1f, 0x9a, 0x0a]);

        let mut out = Vec::new();
        encode_integer(31, 5, 0x00, &mut out);
        assert_eq!(out, [0x1f, 0x00]);
    }

    #[test]
    fn static_exact_match_is_one_octet() {
        let mut encoder = HpackEncoder::new();
        let mut out = Vec::new();
        encoder.encode(&[HeaderField::new(":method", "GET")], &mut out);
        assert_eq!(out, [0x82]);
    }

    #[test]
    fn repeat_emission_becomes_indexed() {
        let mut encoder = HpackEncoder::new();
        let fields = vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":path", "/"),
            HeaderField::new(":authority", "www.example.com"),
        ];

        let first = roundtrip(&mut encoder, &fields);
        assert!(first.len() > 4);

        // The authority literal is now in the dynamic table; the whole
        // request collapses to four indexed references.
        let second = roundtrip(&mut encoder, &fields);
        assert!(second.len() <= 4, "expected 4 indexed octets, got {second:?}");
    }

    #[test]
    fn custom_fields_roundtrip_and_index() {
        let mut encoder = HpackEncoder::new();
        let fields = vec![
            HeaderField::new("x-request-id", "12345678"),
            HeaderField::new("x-request-id", "12345678"),
        ];
        let out = roundtrip(&mut encoder, &fields);
        // Second copy must be a single indexed octet.
        assert_eq!(out[out.len() - 1], 0x80 | 62);
        assert_eq!(encoder.table_len(), 1);
    }

    #[test]
    fn sensitive_flag_forces_never_indexed() {
        let mut encoder = HpackEncoder::new();
        let fields = vec![HeaderField::new("x-token", "opaque").sensitive()];
        let mut out = Vec::new();
        encoder.encode(&fields, &mut out);
        assert_eq!(out[0] & 0xf0, 0x10);
        assert_eq!(encoder.table_len(), 0);

        let mut decoder = HpackDecoder::new();
        let decoded = decoder.decode(&out).unwrap();
        assert!(decoded[0].sensitive);
    }

    #[test]
    fn authorization_is_sensitive_by_policy() {
        let mut encoder = HpackEncoder::new();
        let mut out = Vec::new();
        encoder.encode(&[HeaderField::new("authorization", "Bearer abc")], &mut out);
        // Never-indexed with static name index 23 (4-bit prefix saturates).
        assert_eq!(&out[..2], &[0x1f, 0x08]);
        assert_eq!(encoder.table_len(), 0);
    }

    #[test]
    fn short_cookie_is_sensitive_long_cookie_is_not() {
        let mut encoder = HpackEncoder::new();
        let mut out = Vec::new();
        encoder.encode(&[HeaderField::new("cookie", "sid=1")], &mut out);
        assert_eq!(out[0] & 0xf0, 0x10);
        assert_eq!(encoder.table_len(), 0);

        let mut out = Vec::new();
        encoder.encode(
            &[HeaderField::new("cookie", "sid=0123456789abcdef0123")],
            &mut out,
        );
        assert_eq!(out[0] & 0xc0, 0x40);
        assert_eq!(encoder.table_len(), 1);
    }

    #[test]
    fn volatile_values_are_not_indexed() {
        let mut encoder = HpackEncoder::new();
        for (name, value) in [
            ("content-length", "1024"),
            ("etag", "\"abc\""),
            ("location", "/next"),
            (":path", "/a/b/c"),
        ] {
            let mut out = Vec::new();
            encoder.encode(&[HeaderField::new(name, value)], &mut out);
            // Literal without indexing: 0000 prefix.
            assert_eq!(out[0] & 0xf0, 0x00, "{name} should not be indexed");
        }
        assert_eq!(encoder.table_len(), 0);
    }

    #[test]
    fn capacity_change_is_announced_before_next_block() {
        let mut encoder = HpackEncoder::new();
        encoder.set_capacity(256);

        let mut out = Vec::new();
        encoder.encode(&[HeaderField::new(":method", "GET")], &mut out);
        // 001xxxxx size update for 256, then the indexed field.
        assert_eq!(out[0] & 0xe0, 0x20);

        let mut decoder = HpackDecoder::new();
        let decoded = decoder.decode(&out).unwrap();
        assert_eq!(decoded, vec![HeaderField::new(":method", "GET")]);
    }

    #[test]
    fn eviction_keeps_lookup_consistent() {
        // Capacity for roughly one entry; each insert evicts the previous.
        let mut encoder = HpackEncoder::with_capacity(64);
        for i in 0..16 {
            let field = HeaderField::new("x-counter", format!("{i:08}"));
            let mut out = Vec::new();
            encoder.encode(&[field.clone()], &mut out);
            let mut out2 = Vec::new();
            // Immediate re-emission must hit the table.
            encoder.encode(&[field], &mut out2);
            assert_eq!(out2, [0x80 | 62]);
        }
        assert_eq!(encoder.table_len(), 1);
    }

    #[test]
    fn huffman_only_when_shorter() {
        let mut encoder = HpackEncoder::new();
        let mut out = Vec::new();
        // A value of rare characters expands under Huffman; encoder must
        // fall back to raw bytes (H bit clear).
        encoder.encode(
            &[HeaderField::new("x-bin", vec![0x01, 0x02, 0x03]).sensitive()],
            &mut out,
        );
        let mut decoder = HpackDecoder::new();
        let decoded = decoder.decode(&out).unwrap();
        assert_eq!(decoded[0].value, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn mixed_list_roundtrip() {
        let mut encoder = HpackEncoder::new();
        let fields = vec![
            HeaderField::new(":status", "200"),
            HeaderField::new("content-type", "text/html; charset=utf-8"),
            HeaderField::new("content-length", "512"),
            HeaderField::new("set-cookie", "a=b; Path=/; HttpOnly"),
            HeaderField::new("x-frame-options", "DENY"),
        ];
        roundtrip(&mut encoder, &fields);
    }
}
