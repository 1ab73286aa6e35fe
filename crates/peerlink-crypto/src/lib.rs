//! Cryptography for peerlink chat.
//!
//! Chat messages are end-to-end encrypted per recipient: every peer owns
//! one RSA-OAEP [`KeyPair`], shares its [`PublicKey`] as a [`Jwk`] during
//! the handshake, and every outgoing message is [`seal`]ed once for each
//! known recipient.
//!
//! ```text
//! Chat layer (above)   ← decides who to seal for, owns the key registry
//!     ↕
//! Crypto layer (this crate)  ← keys, JWK interchange, seal/open pipeline
//! ```
//!
//! There is no group key and no forward secrecy. A peer's identity is only
//! as trustworthy as the first public key it presented.

mod compression;
mod error;
mod jwk;
mod keys;
mod sealed;

pub use compression::{CompressionError, compress, decompress, decompress_with_limit};
pub use error::CryptoError;
pub use jwk::{JWK_ALG, Jwk};
pub use keys::{DEFAULT_KEY_BITS, KeyPair, MIN_KEY_BITS, PublicKey};
pub use sealed::{open, seal};
