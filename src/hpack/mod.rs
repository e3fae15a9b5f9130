//! HPACK header compression (RFC 7541).
//!
//! One encoder and one decoder exist per connection; each owns a dynamic
//! table that mirrors its peer's. Blocks must be processed in connection
//! order because the tables are stateful across blocks.

mod decode;
mod encode;
pub mod huffman;
mod table;

pub use decode::HpackDecoder;
pub use encode::HpackEncoder;
pub use huffman::HuffmanError;
pub use table::{DynamicTable, HeaderField, StaticTable};

/// Default SETTINGS_HEADER_TABLE_SIZE.
pub const DEFAULT_TABLE_CAPACITY: usize = 4096;

/// HPACK processing failure. All variants are fatal to the connection and
/// reported on the wire as COMPRESSION_ERROR.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HpackError {
    #[error("header block ends mid-representation")]
    Truncated,
    #[error("integer exceeds the representable range")]
    IntegerOverflow,
    #[error("table index {0} does not resolve")]
    InvalidIndex(usize),
    #[error("dynamic table size update after the block started")]
    MisplacedSizeUpdate,
    #[error("table size update to {requested} exceeds the advertised limit {limit}")]
    SizeUpdateTooLarge { requested: usize, limit: usize },
    #[error("decoded header list exceeds the {limit}-octet limit")]
    HeaderListTooLarge { limit: usize },
    #[error(transparent)]
    Huffman(#[from] HuffmanError),
}
