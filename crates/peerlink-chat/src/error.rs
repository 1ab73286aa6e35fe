//! Error types for the chat layer.

use peerlink_crypto::CryptoError;
use peerlink_protocol::PeerId;
use peerlink_session::SessionError;

/// Errors that can occur during chat operations.
///
/// Only the send path returns these to callers. On the receive path every
/// failure is logged and the offending message discarded.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The local key pair failed to generate; chat is disabled for this
    /// session.
    #[error("local key pair unavailable, chat is disabled")]
    KeysUnavailable,

    /// Wrong key, corrupted payload, or plaintext that is not UTF-8.
    #[error("failed to decrypt chat message")]
    DecryptionFailed,

    /// The message does not fit one RSA-OAEP block for some recipient.
    #[error("chat message is {len} bytes, limit is {max}")]
    MessageTooLong { len: usize, max: usize },

    /// A handshake carried a key that could not be imported.
    #[error("failed to import public key of {peer_id}: {source}")]
    KeyImport {
        peer_id: PeerId,
        #[source]
        source: CryptoError,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Session(#[from] SessionError),
}
