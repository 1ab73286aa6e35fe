//! Core protocol types for peerlink's wire format.
//!
//! Every message between two peers is an [`Envelope`] serialized as JSON.
//! The envelope's payload is opaque at this level; it is interpreted in a
//! second pass as either a [`ChatPayload`] or a [`GamePayload`].

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A peer's identity: an opaque string, unique per session.
///
/// Serialized as a plain JSON string (`#[serde(transparent)]`), which also
/// lets it be used as a JSON object key in [`ChatPayload::Message`].
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps a raw identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the empty identity, which never names a peer.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The outer wire wrapper.
///
/// ```json
/// { "id": "9f2c…" | null, "payload": { … } }
/// ```
///
/// `id` is a correlation id, present only when the sender asked for
/// guaranteed delivery. Nothing acknowledges it yet; it is carried so that
/// ack/retry can be layered on later without a wire change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id for guaranteed sends, `null` otherwise. The key
    /// itself is required.
    #[serde(deserialize_with = "Option::deserialize")]
    pub id: Option<String>,

    /// Opaque content, interpreted by the payload-specific parse pass.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// An envelope without a correlation id.
    pub fn best_effort(payload: serde_json::Value) -> Self {
        Self { id: None, payload }
    }

    /// An envelope carrying a correlation id.
    pub fn correlated(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Some(id.into()),
            payload,
        }
    }

    /// Checks the rules serde can't express.
    ///
    /// # Errors
    /// [`ProtocolError::InvalidMessage`] if the payload is `null` or the
    /// correlation id is an empty string.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.payload.is_null() {
            return Err(ProtocolError::InvalidMessage("envelope payload is null".into()));
        }
        if self.id.as_deref().is_some_and(str::is_empty) {
            return Err(ProtocolError::InvalidMessage(
                "envelope correlation id is empty".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Chat payloads
// ---------------------------------------------------------------------------

/// Chat traffic, internally tagged on `type`.
///
/// ```json
/// { "type": "chatHandshake", "publicKey": { "kty": "RSA", … } }
/// { "type": "chatMessage", "message": { "<peer id>": "<base64>" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatPayload {
    /// "Here is my public key." Sent once per peer on the guaranteed
    /// channel. The key is a JWK object; only its JSON-object shape is
    /// checked here, the crypto layer imports it.
    #[serde(rename = "chatHandshake")]
    Handshake {
        #[serde(rename = "publicKey")]
        public_key: serde_json::Map<String, serde_json::Value>,
    },

    /// Ciphertexts keyed by recipient. A receiver only ever reads the entry
    /// under its own id; other entries are opaque to it.
    #[serde(rename = "chatMessage")]
    Message { message: HashMap<PeerId, String> },
}

impl ChatPayload {
    /// Returns the ciphertext addressed to `recipient`, if any.
    pub fn ciphertext_for(&self, recipient: &PeerId) -> Option<&str> {
        match self {
            Self::Message { message } => message.get(recipient).map(String::as_str),
            Self::Handshake { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Game payloads
// ---------------------------------------------------------------------------

/// A point in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Pulls bodies toward `position` for `duration` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gravitation {
    pub radius: f64,
    pub position: Vector3,
    pub strength: f64,
    pub duration: f64,
}

/// One-shot outward impulse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadialExplosion {
    pub radius: f64,
    pub position: Vector3,
    pub strength: f64,
}

/// Lifts bodies up to `height`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Updraft {
    pub radius: f64,
    pub position: Vector3,
    pub strength: f64,
    pub height: f64,
    pub duration: f64,
}

/// Spins bodies around a vertical axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vortex {
    pub radius: f64,
    pub position: Vector3,
    pub strength: f64,
    pub height: f64,
    pub duration: f64,
}

/// A world event, adjacently tagged on `name` / `payload`.
///
/// ```json
/// { "name": "RADIAL_EXPLOSION", "payload": { "radius": 4, … } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorldAction {
    Gravitation(Gravitation),
    RadialExplosion(RadialExplosion),
    Updraft(Updraft),
    Vortex(Vortex),
}

/// Best-effort game traffic, adjacently tagged on `type` / `data`.
///
/// ```json
/// { "type": "PLAYER_POSITION", "data": { "x": 1, "y": 0, "z": 2 } }
/// { "type": "WORLD_ACTION", "data": { "name": "VORTEX", "payload": { … } } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GamePayload {
    #[serde(rename = "WORLD_ACTION")]
    WorldAction(WorldAction),

    #[serde(rename = "PLAYER_POSITION")]
    PlayerPosition(Vector3),
}

// =========================================================================
// Tests
// =========================================================================
