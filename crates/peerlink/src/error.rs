//! Unified error type for peerlink.

use peerlink_chat::ChatError;
use peerlink_crypto::{CompressionError, CryptoError};
use peerlink_protocol::ProtocolError;
use peerlink_relay::RelayError;
use peerlink_session::SessionError;
use peerlink_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` conversions let `?` lift any layer's error into this one.
#[derive(Debug, thiserror::Error)]
pub enum PeerlinkError {
    /// Endpoint registration, connect, send.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Envelope or payload encode/decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Keys, JWK import, seal/open.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// Invalid peer ids.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Key availability, message length, decryption.
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    /// A node configuration document could not be parsed.
    #[error("invalid node configuration: {0}")]
    Config(#[source] serde_json::Error),
}
