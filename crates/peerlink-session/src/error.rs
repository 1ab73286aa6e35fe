//! Error types for the session layer.

use peerlink_protocol::ProtocolError;

/// Errors returned to callers of the session manager.
///
/// Most failures in this layer are deliberately *not* errors: sending to an
/// unknown peer, a dropped connection, or a malformed inbound message are
/// logged and absorbed. What remains are caller mistakes.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The target id is empty or names the local peer.
    #[error("invalid peer id: {0:?}")]
    InvalidPeerId(String),

    /// The outbound payload could not be serialized.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
