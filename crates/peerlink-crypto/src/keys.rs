//! RSA-OAEP key pairs.
//!
//! Every peer holds exactly one [`KeyPair`] for the lifetime of its session
//! and learns other peers' [`PublicKey`]s through the chat handshake. The
//! scheme is RSA-OAEP with SHA-256 for both the hash and MGF1, public
//! exponent 65537, matching what browsers produce for
//! `{ name: "RSA-OAEP", hash: "SHA-256" }`.

use std::fmt;

use rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::CryptoError;

/// Modulus size used when nothing else is configured.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Smallest modulus accepted for generation. Anything below cannot fit a
/// SHA-256 OAEP block with room for a message.
pub const MIN_KEY_BITS: usize = 1024;

/// OAEP overhead in bytes: two SHA-256 digests plus two framing bytes.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// A remote (or our own) encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub(crate) RsaPublicKey);

impl PublicKey {
    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.0.size() * 8
    }

    /// The largest plaintext a single call to [`encrypt`](Self::encrypt)
    /// accepts. 190 bytes for a 2048-bit key.
    pub fn max_plaintext_len(&self) -> usize {
        self.0.size().saturating_sub(OAEP_SHA256_OVERHEAD)
    }

    /// Encrypts one block. OAEP is randomized, so encrypting the same
    /// plaintext twice yields different ciphertexts.
    ///
    /// # Errors
    /// [`CryptoError::MessageTooLong`] if `plaintext` exceeds
    /// [`max_plaintext_len`](Self::max_plaintext_len). Nothing is ever
    /// truncated.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let max = self.max_plaintext_len();
        if plaintext.len() > max {
            return Err(CryptoError::MessageTooLong {
                len: plaintext.len(),
                max,
            });
        }
        self.0
            .encrypt(&mut OsRng, oaep(), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("bits", &self.bits())
            .finish()
    }
}

/// The local peer's key pair.
///
/// `Debug` prints only the key size; the private half never reaches logs.
pub struct KeyPair {
    pub(crate) private: RsaPrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a fresh [`DEFAULT_KEY_BITS`] key pair.
    ///
    /// This is CPU-heavy (hundreds of milliseconds for 2048 bits); async
    /// callers should run it on a blocking thread.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(DEFAULT_KEY_BITS)
    }

    /// Generates a key pair with a custom modulus size.
    ///
    /// # Errors
    /// [`CryptoError::KeyGeneration`] for sizes below [`MIN_KEY_BITS`] or
    /// if the random source fails.
    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::KeyGeneration(format!(
                "key size {bits} is below the minimum of {MIN_KEY_BITS} bits"
            )));
        }
        let started = std::time::Instant::now();
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        tracing::debug!(bits, elapsed = ?started.elapsed(), "generated RSA key pair");
        Ok(Self::from_private(private))
    }

    pub(crate) fn from_private(private: RsaPrivateKey) -> Self {
        let public = PublicKey(private.to_public_key());
        Self { private, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Decrypts one OAEP block addressed to this key pair.
    ///
    /// # Errors
    /// [`CryptoError::Decryption`] for any failure: wrong key, corrupted
    /// bytes, wrong length.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(oaep(), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &self.public.bits())
            .finish_non_exhaustive()
    }
}
