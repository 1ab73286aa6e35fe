//! Error types for the crypto layer.

use crate::compression::CompressionError;

/// Errors from key handling and the seal/open pipeline.
///
/// Callers on the receive path never surface these to users: a message that
/// fails to open is logged and discarded.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The OS random source or prime search failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// A JWK was malformed, of the wrong type, or mathematically invalid.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The plaintext does not fit in a single OAEP block.
    #[error("plaintext is {len} bytes, limit is {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Wrong key, tampered ciphertext, or bad padding. Deliberately
    /// carries no detail.
    #[error("decryption failed")]
    Decryption,

    /// The armored text was not valid base64.
    #[error("invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error(transparent)]
    Compression(#[from] CompressionError),
}
