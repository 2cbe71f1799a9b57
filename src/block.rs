//! Block format — fully self-describing, mandatory three-way checksums.
//!
//! # On-disk layout (little-endian throughout)
//!
//! ```text
//! HEADER (40 bytes):
//!   header_magic : 8   constant "EMDBBLK\0"
//!   version      : 2   block format version (currently 1)
//!   type         : 1   BlockType discriminant
//!   flags        : 4   low byte = compression, next byte = encryption
//!   encoding     : 1   payload encoding tag
//!   timestamp    : 8   writer-supplied, not used for version precedence
//!   block_id     : 8   caller-chosen identity; duplicates mean overwrite
//!   payload_len  : 4   redundant with footer; must match
//!   header_crc   : 4   CRC32 of bytes [0 .. payload_len offset)
//! PAYLOAD:
//!   payload_crc  : 4   CRC32 of payload bytes that follow
//!   payload      : payload_len
//! FOOTER (12 bytes):
//!   total_crc    : 4   CRC32 over header+payload region
//!   payload_len  : 4   must equal header's payload_len
//!   footer_magic : 4   constant
//! ```
//!
//! # Checksums
//! All three CRC32s are mandatory; there is no opt-out. `header_crc`
//! guards against corruption before any allocation is attempted.
//! `payload_crc` and `total_crc` are checked together on `decode_block`;
//! `header_crc` alone is cheap enough that the scanner checks it before
//! even reading the payload.
//!
//! # Unknown block types
//! Unlike a codec UUID, an unrecognized `BlockType` byte is preserved
//! opaquely rather than rejected — callers that don't understand a type
//! can still copy the block whole (compaction does exactly this).

use std::io::{self, Read};
use std::ops::Range;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use thiserror::Error;

// ── Constants ────────────────────────────────────────────────────────────────

/// On-disk magic for the start of every block header.
pub const HEADER_MAGIC: [u8; 8] = *b"EMDBBLK\0";
/// On-disk magic for the end of every block footer.
pub const FOOTER_MAGIC: [u8; 4] = *b"EMDE";

/// Current block format version.
pub const BLOCK_VERSION: u16 = 1;

/// Fixed byte size of the header, up to and including `header_crc`.
pub const HEADER_SIZE: usize = 40;
/// Fixed byte size of the footer.
pub const FOOTER_SIZE: usize = 12;
/// Byte size of the `payload_crc` field that precedes the payload bytes.
pub const PAYLOAD_CRC_SIZE: usize = 4;

/// `BlockId` reserved for the file's header-at-offset-0 record.
pub const HEADER_BLOCK_ID: i64 = 0;

// ── Flags ────────────────────────────────────────────────────────────────────

/// Low byte: bit 0 = compressed, bits 1-7 = compression algorithm id (1..127).
pub const FLAG_COMPRESSED_BIT: u32 = 0x0000_0001;
/// Byte 1: bit 0 = encrypted, bits 1-7 = encryption algorithm id (1..127).
pub const FLAG_ENCRYPTED_BIT: u32 = 0x0000_0100;

/// Built-in compression algorithm ids, packed into flag bits 1..7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionAlgo {
    None = 0,
    Zstd = 1,
    Lz4 = 2,
    Brotli = 3,
    Lzma = 4,
}

impl CompressionAlgo {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Zstd),
            2 => Some(Self::Lz4),
            3 => Some(Self::Brotli),
            4 => Some(Self::Lzma),
            _ => None,
        }
    }
}

/// Built-in encryption algorithm ids, packed into flag bits 9..15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionAlgo {
    None = 0,
    Aes256Gcm = 1,
}

impl EncryptionAlgo {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Aes256Gcm),
            _ => None,
        }
    }
}

/// Decoded view of the `flags` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(pub u32);

impl Flags {
    pub fn none() -> Self {
        Flags(0)
    }

    pub fn is_compressed(&self) -> bool {
        self.0 & FLAG_COMPRESSED_BIT != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.0 & FLAG_ENCRYPTED_BIT != 0
    }

    /// Raw compression algorithm id, 1..127 (meaningless if not compressed).
    pub fn compression_algo_id(&self) -> u8 {
        ((self.0 & 0x0000_00FE) >> 1) as u8
    }

    /// Raw encryption algorithm id, 1..127 (meaningless if not encrypted).
    pub fn encryption_algo_id(&self) -> u8 {
        ((self.0 & 0x0000_FE00) >> 9) as u8
    }

    pub fn with_compression(mut self, algo: CompressionAlgo) -> Self {
        self.0 &= !0x0000_00FF;
        if !matches!(algo, CompressionAlgo::None) {
            self.0 |= FLAG_COMPRESSED_BIT | ((algo as u32) << 1);
        }
        self
    }

    pub fn with_encryption(mut self, algo: EncryptionAlgo) -> Self {
        self.0 &= !0x0000_FF00;
        if !matches!(algo, EncryptionAlgo::None) {
            self.0 |= FLAG_ENCRYPTED_BIT | ((algo as u32) << 9);
        }
        self
    }
}

// ── Block type ───────────────────────────────────────────────────────────────

/// Discriminates the role of a block. Numeric values are frozen for
/// on-disk compatibility; unknown values round-trip opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Metadata,
    WriteAheadLog,
    FolderTree,
    Folder,
    Segment,
    Cleanup,
    ZoneTreeSegmentKV,
    ZoneTreeSegmentVector,
    FreeSpace,
    EmailBatch,
    FolderEnvelope,
    KeyManager,
    KeyExchange,
    /// Preserves an unrecognized discriminant byte so that compaction and
    /// the scanner never have to reject a block they can't interpret.
    Unknown(u8),
}

impl BlockType {
    pub fn to_u8(self) -> u8 {
        match self {
            BlockType::Metadata => 1,
            BlockType::WriteAheadLog => 2,
            BlockType::FolderTree => 3,
            BlockType::Folder => 4,
            BlockType::Segment => 5,
            BlockType::Cleanup => 6,
            BlockType::ZoneTreeSegmentKV => 7,
            BlockType::ZoneTreeSegmentVector => 8,
            BlockType::FreeSpace => 9,
            BlockType::EmailBatch => 10,
            BlockType::FolderEnvelope => 11,
            BlockType::KeyManager => 12,
            BlockType::KeyExchange => 13,
            BlockType::Unknown(v) => v,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => BlockType::Metadata,
            2 => BlockType::WriteAheadLog,
            3 => BlockType::FolderTree,
            4 => BlockType::Folder,
            5 => BlockType::Segment,
            6 => BlockType::Cleanup,
            7 => BlockType::ZoneTreeSegmentKV,
            8 => BlockType::ZoneTreeSegmentVector,
            9 => BlockType::FreeSpace,
            10 => BlockType::EmailBatch,
            11 => BlockType::FolderEnvelope,
            12 => BlockType::KeyManager,
            13 => BlockType::KeyExchange,
            other => BlockType::Unknown(other),
        }
    }
}

/// Payload encoding tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Protobuf,
    CapnProto,
    Json,
    RawBytes,
    Unknown(u8),
}

impl Encoding {
    pub fn to_u8(self) -> u8 {
        match self {
            Encoding::Protobuf => 0,
            Encoding::CapnProto => 1,
            Encoding::Json => 2,
            Encoding::RawBytes => 3,
            Encoding::Unknown(v) => v,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Encoding::Protobuf,
            1 => Encoding::CapnProto,
            2 => Encoding::Json,
            3 => Encoding::RawBytes,
            other => Encoding::Unknown(other),
        }
    }
}

// ── ExtendedHeader ───────────────────────────────────────────────────────────

/// Self-describing header prefixed to the payload when the Compressed or
/// Encrypted flag bit is set. Versioned so a reader can skip fields it
/// does not understand, provided the version itself is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub uncompressed_size: Option<u64>,
    pub iv: Option<Vec<u8>>,
    pub auth_tag: Option<Vec<u8>>,
    pub key_id: Option<u32>,
}

const EXT_HEADER_VERSION: u8 = 1;

impl ExtendedHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        body.push(EXT_HEADER_VERSION);

        body.push(self.uncompressed_size.is_some() as u8);
        if let Some(size) = self.uncompressed_size {
            body.write_u64::<LittleEndian>(size).expect("vec write");
        }

        body.push(self.iv.is_some() as u8);
        if let Some(iv) = &self.iv {
            body.push(iv.len() as u8);
            body.extend_from_slice(iv);
        }

        body.push(self.auth_tag.is_some() as u8);
        if let Some(tag) = &self.auth_tag {
            body.push(tag.len() as u8);
            body.extend_from_slice(tag);
        }

        body.push(self.key_id.is_some() as u8);
        if let Some(id) = self.key_id {
            body.write_u32::<LittleEndian>(id).expect("vec write");
        }

        out.write_u16::<LittleEndian>(body.len() as u16)
            .expect("vec write");
        out.extend_from_slice(&body);
    }

    /// Parse an extended header from the front of `data`, returning the
    /// parsed header and the number of bytes consumed (including the
    /// 2-byte length prefix).
    fn read_from(data: &[u8]) -> Result<(Self, usize), BlockCodecError> {
        if data.len() < 2 {
            return Err(BlockCodecError::TruncatedBlock);
        }
        let ext_len = u16::from_le_bytes([data[0], data[1]]) as usize;
        let total = 2 + ext_len;
        if data.len() < total {
            return Err(BlockCodecError::TruncatedBlock);
        }
        let body = &data[2..total];
        if body.is_empty() {
            return Err(BlockCodecError::TruncatedBlock);
        }
        let version = body[0];
        if version != EXT_HEADER_VERSION {
            return Err(BlockCodecError::ExtendedHeaderUnsupported { version });
        }

        let mut pos = 1usize;
        let mut hdr = ExtendedHeader::default();

        if read_bool(body, &mut pos)? {
            hdr.uncompressed_size = Some(read_u64(body, &mut pos)?);
        }
        if read_bool(body, &mut pos)? {
            let len = read_u8(body, &mut pos)? as usize;
            hdr.iv = Some(read_bytes(body, &mut pos, len)?);
        }
        if read_bool(body, &mut pos)? {
            let len = read_u8(body, &mut pos)? as usize;
            hdr.auth_tag = Some(read_bytes(body, &mut pos, len)?);
        }
        if read_bool(body, &mut pos)? {
            hdr.key_id = Some(read_u32(body, &mut pos)?);
        }
        // Any unparsed trailing bytes (future fields) are skipped via `total`.

        Ok((hdr, total))
    }
}

fn read_bool(body: &[u8], pos: &mut usize) -> Result<bool, BlockCodecError> {
    Ok(read_u8(body, pos)? != 0)
}
fn read_u8(body: &[u8], pos: &mut usize) -> Result<u8, BlockCodecError> {
    let v = *body.get(*pos).ok_or(BlockCodecError::TruncatedBlock)?;
    *pos += 1;
    Ok(v)
}
fn read_u32(body: &[u8], pos: &mut usize) -> Result<u32, BlockCodecError> {
    let bytes = body
        .get(*pos..*pos + 4)
        .ok_or(BlockCodecError::TruncatedBlock)?;
    *pos += 4;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}
fn read_u64(body: &[u8], pos: &mut usize) -> Result<u64, BlockCodecError> {
    let bytes = body
        .get(*pos..*pos + 8)
        .ok_or(BlockCodecError::TruncatedBlock)?;
    *pos += 8;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}
fn read_bytes(body: &[u8], pos: &mut usize, len: usize) -> Result<Vec<u8>, BlockCodecError> {
    let bytes = body
        .get(*pos..*pos + len)
        .ok_or(BlockCodecError::TruncatedBlock)?;
    *pos += len;
    Ok(bytes.to_vec())
}

// ── Block ────────────────────────────────────────────────────────────────────

/// A fully parsed block: header fields plus the decoded payload (the
/// `ExtendedHeader`, if any, has already been stripped).
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub version: u16,
    pub block_type: BlockType,
    pub flags: Flags,
    pub encoding: Encoding,
    pub timestamp: i64,
    pub block_id: i64,
    pub ext_header: Option<ExtendedHeader>,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn new(block_type: BlockType, block_id: i64, timestamp: i64, payload: Vec<u8>) -> Self {
        Self {
            version: BLOCK_VERSION,
            block_type,
            flags: Flags::none(),
            encoding: Encoding::RawBytes,
            timestamp,
            block_id,
            ext_header: None,
            payload,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BlockCodecError {
    #[error("block header magic mismatch")]
    HeaderMagicMismatch,
    #[error("block footer magic mismatch")]
    FooterMagicMismatch,
    #[error("payload length mismatch between header ({header}) and footer ({footer})")]
    PayloadLengthMismatch { header: u32, footer: u32 },
    #[error("block header CRC32 mismatch")]
    HeaderCrcMismatch,
    #[error("block payload CRC32 mismatch")]
    PayloadCrcMismatch,
    #[error("block total CRC32 mismatch")]
    TotalCrcMismatch,
    #[error("block truncated before its declared length")]
    TruncatedBlock,
    #[error("extended header version {version} is not supported by this build")]
    ExtendedHeaderUnsupported { version: u8 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

// ── encode_block / decode_block ─────────────────────────────────────────────

/// Frame a `Block` into a single contiguous byte buffer.
///
/// `block.payload` is treated as the already-compressed/encrypted bytes
/// (if `block.flags` says so); callers compress/encrypt before calling
/// `encode_block`, and an `ext_header` must be supplied whenever a flag
/// bit is set. Deterministic: the same `Block` always produces the same
/// bytes.
pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut ext_bytes = Vec::new();
    if let Some(ext) = &block.ext_header {
        ext.write_to(&mut ext_bytes);
    }

    let mut full_payload = Vec::with_capacity(ext_bytes.len() + block.payload.len());
    full_payload.extend_from_slice(&ext_bytes);
    full_payload.extend_from_slice(&block.payload);

    let payload_len = full_payload.len() as u32;

    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(&HEADER_MAGIC);
    header.write_u16::<LittleEndian>(block.version).unwrap();
    header.push(block.block_type.to_u8());
    header.write_u32::<LittleEndian>(block.flags.0).unwrap();
    header.push(block.encoding.to_u8());
    header.write_i64::<LittleEndian>(block.timestamp).unwrap();
    header.write_i64::<LittleEndian>(block.block_id).unwrap();
    header.write_u32::<LittleEndian>(payload_len).unwrap();
    debug_assert_eq!(header.len(), HEADER_SIZE - 4);

    let mut header_hasher = Hasher::new();
    header_hasher.update(&header);
    let header_crc = header_hasher.finalize();
    header.write_u32::<LittleEndian>(header_crc).unwrap();
    debug_assert_eq!(header.len(), HEADER_SIZE);

    let mut payload_hasher = Hasher::new();
    payload_hasher.update(&full_payload);
    let payload_crc = payload_hasher.finalize();

    let mut out =
        Vec::with_capacity(HEADER_SIZE + PAYLOAD_CRC_SIZE + full_payload.len() + FOOTER_SIZE);
    out.extend_from_slice(&header);
    out.write_u32::<LittleEndian>(payload_crc).unwrap();
    out.extend_from_slice(&full_payload);

    let mut total_hasher = Hasher::new();
    total_hasher.update(&out);
    let total_crc = total_hasher.finalize();
    out.write_u32::<LittleEndian>(total_crc).unwrap();
    out.write_u32::<LittleEndian>(payload_len).unwrap();
    out.extend_from_slice(&FOOTER_MAGIC);

    out
}

/// Parse and fully validate a framed block from `buf`.
///
/// Returns the parsed `Block` plus the byte range of the (ext-header
/// stripped) payload within `buf`. Validates, in order: header magic,
/// header CRC, declared-vs-footer payload length, payload CRC, total CRC,
/// footer magic.
pub fn decode_block(buf: &[u8]) -> Result<(Block, Range<usize>), BlockCodecError> {
    if buf.len() < HEADER_SIZE {
        return Err(BlockCodecError::TruncatedBlock);
    }
    if buf[0..8] != HEADER_MAGIC {
        return Err(BlockCodecError::HeaderMagicMismatch);
    }

    let mut header_hasher = Hasher::new();
    header_hasher.update(&buf[0..HEADER_SIZE - 4]);
    let expected_header_crc = header_hasher.finalize();
    let stored_header_crc = (&buf[HEADER_SIZE - 4..HEADER_SIZE]).read_u32::<LittleEndian>()?;
    if expected_header_crc != stored_header_crc {
        return Err(BlockCodecError::HeaderCrcMismatch);
    }

    let mut cursor = &buf[8..];
    let version = cursor.read_u16::<LittleEndian>()?;
    let block_type = BlockType::from_u8(read_u8_stream(&mut cursor)?);
    let flags = Flags(cursor.read_u32::<LittleEndian>()?);
    let encoding = Encoding::from_u8(read_u8_stream(&mut cursor)?);
    let timestamp = cursor.read_i64::<LittleEndian>()?;
    let block_id = cursor.read_i64::<LittleEndian>()?;
    let payload_len = cursor.read_u32::<LittleEndian>()?;

    let payload_start = HEADER_SIZE + PAYLOAD_CRC_SIZE;
    let payload_end = payload_start + payload_len as usize;
    let footer_end = payload_end + FOOTER_SIZE;
    if buf.len() < footer_end {
        return Err(BlockCodecError::TruncatedBlock);
    }

    let stored_payload_crc = (&buf[HEADER_SIZE..payload_start]).read_u32::<LittleEndian>()?;
    let full_payload = &buf[payload_start..payload_end];
    let mut payload_hasher = Hasher::new();
    payload_hasher.update(full_payload);
    if payload_hasher.finalize() != stored_payload_crc {
        return Err(BlockCodecError::PayloadCrcMismatch);
    }

    let footer = &buf[payload_end..footer_end];
    let stored_total_crc = (&footer[0..4]).read_u32::<LittleEndian>()?;
    let footer_payload_len = (&footer[4..8]).read_u32::<LittleEndian>()?;
    if footer_payload_len != payload_len {
        return Err(BlockCodecError::PayloadLengthMismatch {
            header: payload_len,
            footer: footer_payload_len,
        });
    }
    if footer[8..12] != FOOTER_MAGIC {
        return Err(BlockCodecError::FooterMagicMismatch);
    }

    let mut total_hasher = Hasher::new();
    total_hasher.update(&buf[0..payload_end]);
    if total_hasher.finalize() != stored_total_crc {
        return Err(BlockCodecError::TotalCrcMismatch);
    }

    let (ext_header, ext_consumed) = if flags.is_compressed() || flags.is_encrypted() {
        let (hdr, consumed) = ExtendedHeader::read_from(full_payload)?;
        (Some(hdr), consumed)
    } else {
        (None, 0)
    };

    let payload_range = (payload_start + ext_consumed)..payload_end;
    let block = Block {
        version,
        block_type,
        flags,
        encoding,
        timestamp,
        block_id,
        ext_header,
        payload: buf[payload_range.clone()].to_vec(),
    };

    Ok((block, payload_range))
}

fn read_u8_stream<R: Read>(mut r: R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

/// Returns `true` if `buf[pos..]` begins with a valid header magic.
pub fn has_header_magic_at(buf: &[u8], pos: usize) -> bool {
    buf.len() >= pos + HEADER_MAGIC.len() && buf[pos..pos + HEADER_MAGIC.len()] == HEADER_MAGIC
}
