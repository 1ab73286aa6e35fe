//! The per-recipient message pipeline.
//!
//! ```text
//! seal:  plaintext → RSA-OAEP encrypt → zlib deflate → base64
//! open:  base64 → zlib inflate → RSA-OAEP decrypt → plaintext
//! ```
//!
//! Base64 here is the standard alphabet with padding (what `btoa` emits),
//! not the URL-safe variant used inside JWKs.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::compression::{compress, decompress_with_limit};
use crate::{CryptoError, KeyPair, PublicKey};

/// Encrypts `plaintext` for one recipient and armors it for JSON transport.
///
/// # Errors
/// [`CryptoError::MessageTooLong`] if the plaintext does not fit in one
/// OAEP block for `recipient`'s key size.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let ciphertext = recipient.encrypt(plaintext)?;
    let compressed = compress(&ciphertext)?;
    Ok(STANDARD.encode(compressed))
}

/// Reverses [`seal`] using the local key pair.
///
/// A valid ciphertext inflates to exactly the key size, so inflation is
/// capped there.
///
/// # Errors
/// Any stage can fail: [`CryptoError::Encoding`], [`CryptoError::Compression`]
/// or [`CryptoError::Decryption`].
pub fn open(keys: &KeyPair, sealed: &str) -> Result<Vec<u8>, CryptoError> {
    let compressed = STANDARD.decode(sealed.trim())?;
    let limit = keys.public_key().bits().div_ceil(8);
    let ciphertext = decompress_with_limit(&compressed, limit)?;
    keys.decrypt(&ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompressionError;
    use crate::keys::tests::{other_test_keys, test_keys};

    #[test]
    fn test_seal_open_roundtrip() {
        let keys = test_keys();

        let sealed = seal(keys.public_key(), "héllo wörld".as_bytes()).unwrap();

        assert_eq!(open(keys, &sealed).unwrap(), "héllo wörld".as_bytes());
    }

    #[test]
    fn test_seal_output_is_standard_base64() {
        let sealed = seal(test_keys().public_key(), b"x").unwrap();

        assert!(STANDARD.decode(&sealed).is_ok());
        assert!(!sealed.contains('-') && !sealed.contains('_'));
    }

    #[test]
    fn test_open_with_other_key_returns_decryption_error() {
        let sealed = seal(test_keys().public_key(), b"for someone else").unwrap();

        let result = open(other_test_keys(), &sealed);

        assert!(matches!(result, Err(CryptoError::Decryption)));
    }

    #[test]
    fn test_open_invalid_base64_returns_encoding_error() {
        let result = open(test_keys(), "not base64!!");
        assert!(matches!(result, Err(CryptoError::Encoding(_))));
    }

    #[test]
    fn test_open_valid_base64_non_zlib_returns_compression_error() {
        let armored = STANDARD.encode(b"plain bytes");

        let result = open(test_keys(), &armored);

        assert!(matches!(result, Err(CryptoError::Compression(_))));
    }

    #[test]
    fn test_open_oversized_inflation_rejected() {
        let bomb = STANDARD.encode(compress(&vec![0u8; 64 * 1024]).unwrap());

        let result = open(test_keys(), &bomb);

        assert!(matches!(
            result,
            Err(CryptoError::Compression(CompressionError::TooLarge { .. }))
        ));
    }
}
