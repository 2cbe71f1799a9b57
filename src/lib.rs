//! # emaildb-core — append-only checksummed block file + email batching/dedup
//!
//! Format guarantees:
//! - All multi-byte numeric fields are little-endian, never negotiated.
//! - Every block is self-describing: magic, version, type, three mandatory
//!   CRC32 checksums (header, payload, total).
//! - Unlike a frozen codec identity, an unrecognized `BlockType` byte is
//!   preserved opaquely rather than rejected.
//! - The file's header-at-offset-0 is the only block ever rewritten in
//!   place; every other write is an append.
//! - The in-memory `BlockIndex` is rebuildable from scratch at any time by
//!   scanning the raw bytes forward — no block carries a pointer to "the
//!   next" or "the previous" block that the scanner depends on.

pub mod batch;
pub mod block;
pub mod block_file;
pub mod block_index;
pub mod codec;
pub mod compactor;
pub mod crypto;
pub mod email;
pub mod email_store;
pub mod index;
pub mod scanner;
pub mod sizer;

// Flat re-exports for the most common types.
pub use batch::{BatchBuilder, BatchToc};
pub use block::{
    decode_block, encode_block, Block, BlockCodecError, BlockType, CompressionAlgo, Encoding,
    EncryptionAlgo, Flags, BLOCK_VERSION, FOOTER_SIZE, HEADER_BLOCK_ID, HEADER_SIZE,
};
pub use block_file::{BlockFile, BlockFileError};
pub use block_index::{BlockIndex, BlockIndexError, BlockLocation};
pub use codec::{get_codec, get_codec_by_id, Codec, CodecError};
pub use compactor::{compact, verify_and_remove_backup, CompactionStats, CompactorError};
pub use crypto::{decrypt, derive_key, encrypt, CryptoError};
pub use email::{parse_message, EmailParseError, EnvelopeFields, Message};
pub use email_store::{CompoundId, EmailIndexes, EmailStore, EmailStoreError};
pub use index::{BTreeMapIndex, ExternalIndex};
pub use scanner::{scan, scan_backward, ScanReport, ScanWarning};
pub use sizer::target_batch_size;
