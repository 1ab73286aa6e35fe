//! Error types for the protocol layer.

/// Errors that can occur while encoding, decoding, or validating messages.
///
/// Receivers treat every variant the same way: the offending message is
/// dropped at the boundary and never reaches an event feed.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing required fields,
    /// wrong data types, or an unknown `type` tag.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message parsed but violates a protocol rule, e.g. an envelope
    /// whose payload is `null`.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
