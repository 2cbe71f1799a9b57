//! Compression codec registry, re-keyed from a frozen UUID identity to
//! the small integer algorithm id carried directly in a block's `Flags`
//! field (bits 1..7 of the low byte, see `block::CompressionAlgo`).
//!
//! Unlike a codec UUID, an algorithm id here is only ever consulted when
//! the Compressed flag bit is set; `CompressionAlgo::None` (id 0) never
//! reaches this registry at all — the caller skips compression entirely.

use std::io::{self, Read, Write};
use thiserror::Error;

use crate::block::CompressionAlgo;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("unrecognized compression algorithm id {0}")]
    UnknownAlgorithm(u8),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub trait Codec: Send + Sync {
    fn algo(&self) -> CompressionAlgo;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn algo(&self) -> CompressionAlgo {
        CompressionAlgo::None
    }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn algo(&self) -> CompressionAlgo {
        CompressionAlgo::Zstd
    }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn algo(&self) -> CompressionAlgo {
        CompressionAlgo::Lz4
    }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn algo(&self) -> CompressionAlgo {
        CompressionAlgo::Brotli
    }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn algo(&self) -> CompressionAlgo {
        CompressionAlgo::Lzma
    }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// Resolve a `CompressionAlgo` to its built-in implementation.
/// `CompressionAlgo::None` never needs to reach here in practice, but is
/// handled for completeness.
pub fn get_codec(algo: CompressionAlgo) -> Result<Box<dyn Codec>, CodecError> {
    match algo {
        CompressionAlgo::None => Ok(Box::new(NoneCodec)),
        CompressionAlgo::Zstd => Ok(Box::new(ZstdCodec)),
        CompressionAlgo::Lz4 => Ok(Box::new(Lz4Codec)),
        CompressionAlgo::Brotli => Ok(Box::new(BrotliCodec)),
        CompressionAlgo::Lzma => Ok(Box::new(LzmaCodec)),
    }
}

/// Resolve a raw flag-bit algorithm id to its built-in implementation.
pub fn get_codec_by_id(id: u8) -> Result<Box<dyn Codec>, CodecError> {
    CompressionAlgo::from_u8(id)
        .ok_or(CodecError::UnknownAlgorithm(id))
        .and_then(get_codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_codec_is_identity() {
        let c = get_codec(CompressionAlgo::None).unwrap();
        let data = b"hello world";
        assert_eq!(c.compress(data, 0).unwrap(), data);
        assert_eq!(c.decompress(data).unwrap(), data);
    }

    #[test]
    fn zstd_round_trips() {
        let c = get_codec(CompressionAlgo::Zstd).unwrap();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let compressed = c.compress(&data, 3).unwrap();
        let decompressed = c.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn lz4_round_trips() {
        let c = get_codec(CompressionAlgo::Lz4).unwrap();
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let compressed = c.compress(&data, 0).unwrap();
        assert_eq!(c.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn unknown_algorithm_id_is_rejected() {
        assert!(matches!(
            get_codec_by_id(99),
            Err(CodecError::UnknownAlgorithm(99))
        ));
    }
}
