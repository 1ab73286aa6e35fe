//! Codec trait and implementations for serializing/deserializing messages.
//!
//! The session layer doesn't care how envelopes become bytes; it holds
//! something that implements [`Codec`]. [`JsonCodec`] is the only
//! implementation because every peer on the wire speaks JSON.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// ## Trait bounds explained
///
/// - `Send + Sync` → one codec is shared by the send path and every
///   per-connection driver, and Tokio may run those on any worker thread.
/// - `'static` → the codec lives inside the session manager's shared
///   state for as long as the manager runs, so it can't borrow anything
///   shorter-lived.
///
/// ## Why `DeserializeOwned`
///
/// Frames arrive as byte buffers owned by the transport and are dropped
/// right after decoding. `DeserializeOwned` (rather than `Deserialize<'de>`)
/// makes the decoded value own its strings, so an envelope can outlive the
/// frame it came from and be handed to a broadcast channel.
///
/// ## Why a trait with one implementation
///
/// Every peer on the wire speaks JSON today. Envelope validation
/// ([`decode_envelope`](crate::decode_envelope)) is still written against
/// the trait, so the checks that serde can't express live in one place no
/// matter which format carried the bytes.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ## Example
///
/// ```rust
/// use peerlink_protocol::{Codec, Envelope, JsonCodec};
///
/// let codec = JsonCodec;
/// let envelope = Envelope::best_effort(serde_json::json!({"type": "PLAYER_POSITION"}));
///
/// let bytes = codec.encode(&envelope).unwrap();
/// let decoded: Envelope = codec.decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
