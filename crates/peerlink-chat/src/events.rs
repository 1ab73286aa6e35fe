//! Chat events and the bounded local message log.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use peerlink_protocol::PeerId;
use serde::Serialize;

/// Something the chat UI should show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A decrypted message, or the local echo of one we sent.
    Message {
        from: PeerId,
        text: String,
        timestamp_ms: u64,
    },
    /// A peer's handshake was accepted; it can now be written to.
    PeerJoined { peer_id: PeerId, timestamp_ms: u64 },
    /// A previously joined peer disconnected.
    PeerLeft { peer_id: PeerId, timestamp_ms: u64 },
}

impl ChatEvent {
    pub(crate) fn message(from: PeerId, text: String) -> Self {
        Self::Message {
            from,
            text,
            timestamp_ms: now_ms(),
        }
    }

    pub(crate) fn joined(peer_id: PeerId) -> Self {
        Self::PeerJoined {
            peer_id,
            timestamp_ms: now_ms(),
        }
    }

    pub(crate) fn left(peer_id: PeerId) -> Self {
        Self::PeerLeft {
            peer_id,
            timestamp_ms: now_ms(),
        }
    }

    /// The sender (for messages) or the subject (for system events).
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Message { from, .. } => from,
            Self::PeerJoined { peer_id, .. } | Self::PeerLeft { peer_id, .. } => peer_id,
        }
    }

    /// Unix time in milliseconds when the event was produced locally.
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Self::Message { timestamp_ms, .. }
            | Self::PeerJoined { timestamp_ms, .. }
            | Self::PeerLeft { timestamp_ms, .. } => *timestamp_ms,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// In-memory message log. Nothing is persisted.
///
/// Once the log grows past `limit`, the oldest `trim` entries are dropped
/// in one go rather than one per insert.
#[derive(Debug)]
pub(crate) struct ChatHistory {
    entries: VecDeque<ChatEvent>,
    limit: usize,
    trim: usize,
}

impl ChatHistory {
    pub(crate) fn new(limit: usize, trim: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
            trim,
        }
    }

    pub(crate) fn push(&mut self, event: ChatEvent) {
        if self.limit == 0 {
            return;
        }
        self.entries.push_back(event);
        if self.entries.len() > self.limit {
            let drop = self.trim.min(self.entries.len());
            self.entries.drain(..drop);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<ChatEvent> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> ChatEvent {
        ChatEvent::message(PeerId::from("a"), n.to_string())
    }

    fn texts(history: &ChatHistory) -> Vec<String> {
        history
            .snapshot()
            .into_iter()
            .map(|e| match e {
                ChatEvent::Message { text, .. } => text,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_history_keeps_entries_up_to_limit() {
        let mut history = ChatHistory::new(3, 2);
        for n in 0..3 {
            history.push(msg(n));
        }
        assert_eq!(texts(&history), ["0", "1", "2"]);
    }

    #[test]
    fn test_history_overflow_drops_oldest_batch() {
        let mut history = ChatHistory::new(3, 2);
        for n in 0..4 {
            history.push(msg(n));
        }
        assert_eq!(texts(&history), ["2", "3"]);
    }

    #[test]
    fn test_history_zero_limit_keeps_nothing() {
        let mut history = ChatHistory::new(0, 1);
        history.push(msg(0));
        assert!(history.snapshot().is_empty());
    }

    #[test]
    fn test_chat_event_accessors() {
        let event = ChatEvent::left(PeerId::from("bob"));
        assert_eq!(event.peer_id(), &PeerId::from("bob"));
        assert!(event.timestamp_ms() > 0);
    }

    #[test]
    fn test_chat_event_serializes_with_kind_tag() {
        let event = ChatEvent::PeerJoined {
            peer_id: PeerId::from("bob"),
            timestamp_ms: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "peer_joined", "peer_id": "bob", "timestamp_ms": 5})
        );
    }
}
