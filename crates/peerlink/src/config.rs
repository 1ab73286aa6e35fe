//! Node configuration: one document for every layer.

use peerlink_chat::ChatConfig;
use peerlink_relay::RelayConfig;
use peerlink_session::SessionConfig;
use serde::Deserialize;

use crate::PeerlinkError;

/// Configuration for a whole [`Node`](crate::Node).
///
/// Every section and every field is optional; omitted values take their
/// defaults.
///
/// ```json
/// {
///   "session": { "connect_timeout_secs": 10, "id_prefix": "player" },
///   "chat": { "key_bits": 2048 },
///   "relay": { "position_rate_hz": 10 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub session: SessionConfig,
    pub chat: ChatConfig,
    pub relay: RelayConfig,
}

impl NodeConfig {
    /// Parses a JSON configuration document.
    ///
    /// # Errors
    /// [`PeerlinkError::Config`] if the document is not valid JSON or a
    /// field has the wrong type.
    pub fn from_json(json: &str) -> Result<Self, PeerlinkError> {
        serde_json::from_str(json).map_err(PeerlinkError::Config)
    }
}
