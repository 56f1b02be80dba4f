//! Per-block compression. One method (Zstandard), three levels.
//!
//! Level `none` is a pass-through: the payload is stored verbatim and the
//! stored/uncompressed lengths are equal. Decompression always cross-checks
//! the stored uncompressed length against the result.

use crate::types::CompressionLevel;
use thiserror::Error;

/// Zstd levels for the medium/high settings.
const ZSTD_LEVEL_MEDIUM: i32 = 3;
const ZSTD_LEVEL_HIGH: i32 = 19;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("block compression failed: {0}")]
    BlockCompressionFailed(String),
    #[error("block decompression failed: {0}")]
    BlockDecompressionFailed(String),
    #[error("block decompression failed: expected {expected} bytes, produced {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Compress one block payload. Returns the stored bytes; original and stored
/// lengths are the caller's to record in the block header.
pub fn compress(data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, CompressionError> {
    match level {
        CompressionLevel::None => Ok(data.to_vec()),
        CompressionLevel::Medium => encode(data, ZSTD_LEVEL_MEDIUM),
        CompressionLevel::High => encode(data, ZSTD_LEVEL_HIGH),
    }
}

/// Decompress one stored block payload. `orig_len` is the uncompressed
/// length recorded in the block header; any disagreement is corruption.
pub fn decompress(
    data: &[u8],
    level: CompressionLevel,
    orig_len: usize,
) -> Result<Vec<u8>, CompressionError> {
    let out = match level {
        CompressionLevel::None => data.to_vec(),
        CompressionLevel::Medium | CompressionLevel::High => zstd::decode_all(data)
            .map_err(|e| CompressionError::BlockDecompressionFailed(e.to_string()))?,
    };
    if out.len() != orig_len {
        return Err(CompressionError::LengthMismatch { expected: orig_len, actual: out.len() });
    }
    Ok(out)
}

fn encode(data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
    zstd::encode_all(data, level).map_err(|e| CompressionError::BlockCompressionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_levels() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        for level in [CompressionLevel::None, CompressionLevel::Medium, CompressionLevel::High] {
            let stored = compress(&data, level).unwrap();
            let back = decompress(&stored, level, data.len()).unwrap();
            assert_eq!(back, data);
        }
    }

    #[test]
    fn none_is_passthrough() {
        let data = b"verbatim payload";
        let stored = compress(data, CompressionLevel::None).unwrap();
        assert_eq!(stored, data);
    }

    #[test]
    fn truncated_input_fails() {
        let data = vec![0x42u8; 8192];
        let stored = compress(&data, CompressionLevel::Medium).unwrap();
        let err = decompress(&stored[..stored.len() / 2], CompressionLevel::Medium, data.len());
        assert!(matches!(err, Err(CompressionError::BlockDecompressionFailed(_))));
    }

    #[test]
    fn wrong_orig_len_is_corruption() {
        let data = vec![0x42u8; 1024];
        let stored = compress(&data, CompressionLevel::Medium).unwrap();
        assert!(matches!(
            decompress(&stored, CompressionLevel::Medium, 1023),
            Err(CompressionError::LengthMismatch { expected: 1023, actual: 1024 })
        ));
    }
}
