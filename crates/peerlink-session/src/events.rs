//! Event feeds published by the session manager.
//!
//! All events go out on one ordered broadcast channel per manager, so a
//! subscriber that watches both peers and messages (the node dispatcher)
//! sees them in the order they happened: a peer's departure is never
//! observed after a message that arrived on its replacement connection.
//! [`PeerEvents`] and [`Messages`] are filtered views for consumers that
//! only care about one kind.

use peerlink_protocol::PeerId;
use peerlink_transport::ChannelKind;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// How hard to try delivering an outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Default channel: unordered, no retransmits.
    #[default]
    BestEffort,
    /// Guaranteed channel (ordered, bounded retransmits) when open,
    /// otherwise falls back to the default channel.
    Guaranteed,
}

/// A peer joined or left the active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Both channels are open; the peer can be sent to.
    Added(PeerId),
    /// A previously added peer is gone.
    Removed(PeerId),
}

impl PeerEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Added(id) | Self::Removed(id) => id,
        }
    }
}

/// A validated envelope received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub from: PeerId,
    /// Present when the sender asked for guaranteed delivery.
    pub correlation_id: Option<String>,
    /// Still opaque; interpreting it is the consumer's job.
    pub payload: serde_json::Value,
    /// The channel it arrived on.
    pub channel: ChannelKind,
}

/// Everything the session manager publishes, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Peer(PeerEvent),
    Message(MessageEvent),
}

/// Peer add/remove events only. Dropping it unsubscribes.
pub struct PeerEvents {
    rx: broadcast::Receiver<SessionEvent>,
}

impl PeerEvents {
    pub(crate) fn new(rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the next peer event.
    ///
    /// # Errors
    /// [`RecvError::Lagged`] if this subscriber fell behind,
    /// [`RecvError::Closed`] once the manager is gone.
    pub async fn recv(&mut self) -> Result<PeerEvent, RecvError> {
        loop {
            if let SessionEvent::Peer(event) = self.rx.recv().await? {
                return Ok(event);
            }
        }
    }

    /// Returns the next buffered peer event without waiting.
    pub fn try_recv(&mut self) -> Result<PeerEvent, TryRecvError> {
        loop {
            if let SessionEvent::Peer(event) = self.rx.try_recv()? {
                return Ok(event);
            }
        }
    }
}

/// Inbound message events only. Dropping it unsubscribes.
pub struct Messages {
    rx: broadcast::Receiver<SessionEvent>,
}

impl Messages {
    pub(crate) fn new(rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the next inbound message.
    ///
    /// # Errors
    /// Same as [`PeerEvents::recv`].
    pub async fn recv(&mut self) -> Result<MessageEvent, RecvError> {
        loop {
            if let SessionEvent::Message(event) = self.rx.recv().await? {
                return Ok(event);
            }
        }
    }

    /// Returns the next buffered message without waiting.
    pub fn try_recv(&mut self) -> Result<MessageEvent, TryRecvError> {
        loop {
            if let SessionEvent::Message(event) = self.rx.try_recv()? {
                return Ok(event);
            }
        }
    }
}
