//! Byte compressors for segment payloads
//!
//! Both the per-series Gorilla streams and the metadata block pass through
//! one of these codecs before hitting disk. The codec is part of the
//! database configuration; a segment must be read back with the codec it
//! was written with.

use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};

const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Byte-compression codec applied to segment payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Identity passthrough
    None,
    /// LZ4 with a length prefix, fast path
    #[default]
    Lz4,
    /// Zstandard, stronger ratio
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    /// Compress `src`. Identity returns the input unchanged.
    pub fn compress(&self, src: &[u8]) -> Vec<u8> {
        match self {
            Compression::None => src.to_vec(),
            Compression::Lz4 => lz4_flex::compress_prepend_size(src),
            Compression::Zstd => {
                // encode_all only fails on I/O, which a Vec sink cannot hit
                zstd::encode_all(src, DEFAULT_ZSTD_LEVEL)
                    .expect("zstd encoding to an in-memory buffer cannot fail")
            }
        }
    }

    /// Decompress `src` produced by [`Compression::compress`].
    pub fn decompress(&self, src: &[u8]) -> StorageResult<Vec<u8>> {
        match self {
            Compression::None => Ok(src.to_vec()),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(src)
                .map_err(|e| StorageError::Compression(format!("lz4 decompress: {}", e))),
            Compression::Zstd => zstd::decode_all(src)
                .map_err(|e| StorageError::Compression(format!("zstd decompress: {}", e))),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..2000u32 {
            data.extend_from_slice(&(i / 7).to_le_bytes());
        }
        data
    }

    #[test]
    fn test_noop_passthrough() {
        let data = sample();
        let out = Compression::None.compress(&data);
        assert_eq!(out, data);
        assert_eq!(Compression::None.decompress(&out).unwrap(), data);
    }

    #[test]
    fn test_lz4_roundtrip_shrinks() {
        let data = sample();
        let out = Compression::Lz4.compress(&data);
        assert!(out.len() < data.len());
        assert_eq!(Compression::Lz4.decompress(&out).unwrap(), data);
    }

    #[test]
    fn test_zstd_roundtrip_shrinks() {
        let data = sample();
        let out = Compression::Zstd.compress(&data);
        assert!(out.len() < data.len());
        assert_eq!(Compression::Zstd.decompress(&out).unwrap(), data);
    }

    #[test]
    fn test_garbage_input_fails() {
        let garbage = vec![0xfe; 32];
        assert!(Compression::Lz4.decompress(&garbage).is_err());
        assert!(Compression::Zstd.decompress(&garbage).is_err());
    }
}
