//! zlib compression for ciphertexts.
//!
//! The output is zlib-wrapped DEFLATE (RFC 1950), the same framing browser
//! peers produce, so compressed blobs are interchangeable with them.

use std::io::Read;

use flate2::Compression;
use flate2::read::{ZlibDecoder, ZlibEncoder};

/// Compression errors.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    Compress(std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),

    /// Inflated output grew past the caller's bound.
    #[error("decompressed data exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Compresses `data` into a zlib stream. Empty input is valid and yields
/// a short non-empty stream.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = ZlibEncoder::new(data, Compression::default());
    let mut compressed = Vec::new();
    encoder
        .read_to_end(&mut compressed)
        .map_err(CompressionError::Compress)?;
    Ok(compressed)
}

/// Inflates a zlib stream produced by [`compress`] (or any zlib encoder).
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(CompressionError::Decompress)?;
    Ok(decompressed)
}

/// Like [`decompress`], but refuses to inflate more than `limit` bytes.
///
/// Ciphertexts have a known maximum size, so receivers use this to stop a
/// tiny hostile stream from expanding into megabytes.
pub fn decompress_with_limit(
    data: &[u8],
    limit: usize,
) -> Result<Vec<u8>, CompressionError> {
    // Read one byte past the limit so an exact fit is distinguishable
    // from an overflow.
    let mut decoder = ZlibDecoder::new(data).take(limit as u64 + 1);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(CompressionError::Decompress)?;
    if decompressed.len() > limit {
        return Err(CompressionError::TooLarge { limit });
    }
    Ok(decompressed)
}
