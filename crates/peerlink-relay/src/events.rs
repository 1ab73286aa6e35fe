//! Game events delivered to the consumer.

use peerlink_protocol::{GamePayload, PeerId};

/// A game payload received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct GameEvent {
    pub from: PeerId,
    pub payload: GamePayload,
}

impl GameEvent {
    /// The wire tag of the payload: `"WORLD_ACTION"` or
    /// `"PLAYER_POSITION"`.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            GamePayload::WorldAction(_) => "WORLD_ACTION",
            GamePayload::PlayerPosition(_) => "PLAYER_POSITION",
        }
    }
}
