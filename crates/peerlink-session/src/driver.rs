//! Per-connection driver: one Tokio task per registered connection.
//!
//! The flow is:
//!   1. Pull transport events until both channels are open (bounded by the
//!      connect timeout) → announce the peer
//!   2. Forward validated envelopes as message events
//!   3. On the first close/error/terminal ICE state, or when the event
//!      stream ends → release the slot and close the connection

use std::sync::Arc;

use peerlink_protocol::{PeerId, decode_envelope};
use peerlink_transport::{ChannelKind, ConnectionEvent, ConnectionId, PeerConnection, PeerTransport};
use tokio::time::Instant;

use crate::events::{MessageEvent, PeerEvent};
use crate::manager::Shared;
use crate::session::Transition;

/// What the driver loop should do after one event.
enum Step {
    Continue,
    /// The peer was announced; the connect timeout no longer applies.
    Ready,
    Stop,
}

pub(crate) async fn drive_connection<T: PeerTransport>(
    shared: Arc<Shared<T>>,
    conn: Arc<T::Connection>,
) {
    let conn_id = conn.id();
    let peer_id = PeerId::from(conn.remote_id());
    let mut deadline = shared.config.connect_timeout().map(|t| Instant::now() + t);

    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, conn.next_event()).await {
                Ok(event) => event,
                Err(_) => {
                    tracing::warn!(%peer_id, %conn_id, "channels not open before timeout, abandoning connection");
                    break;
                }
            },
            None => conn.next_event().await,
        };

        let Some(event) = next else {
            tracing::debug!(%peer_id, %conn_id, "connection event stream ended");
            break;
        };

        match step(&shared, &peer_id, conn_id, event).await {
            Step::Continue => {}
            Step::Ready => deadline = None,
            Step::Stop => break,
        }
    }

    shared.release(&peer_id, &conn).await;
}

async fn step<T: PeerTransport>(
    shared: &Shared<T>,
    peer_id: &PeerId,
    conn_id: ConnectionId,
    event: ConnectionEvent,
) -> Step {
    if let ConnectionEvent::Message { channel, data } = event {
        return forward(shared, peer_id, conn_id, channel, &data).await;
    }

    let mut peers = shared.peers.lock().await;
    let Some(slot) = peers.get_mut(peer_id) else {
        return Step::Stop;
    };
    if slot.conn.id() != conn_id {
        tracing::error!(
            %peer_id,
            %conn_id,
            registered = %slot.conn.id(),
            "connection mismatch, aborting connection"
        );
        return Step::Stop;
    }

    match slot.lifecycle.on_event(&event) {
        Transition::Ready => {
            tracing::info!(%peer_id, %conn_id, "peer ready");
            shared.publish_peer(PeerEvent::Added(peer_id.clone()));
            Step::Ready
        }
        Transition::Closed { .. } => {
            tracing::debug!(%peer_id, %conn_id, ?event, "connection closing");
            Step::Stop
        }
        Transition::Unchanged => {
            tracing::trace!(%peer_id, %conn_id, ?event, state = ?slot.lifecycle.state(), "connection event");
            Step::Continue
        }
    }
}

/// Validates an inbound frame and publishes it.
///
/// Frames are accepted from any registered connection, ready or not: the
/// remote may finish its side first and start talking (its handshake, say)
/// before our last channel-open event has been processed.
async fn forward<T: PeerTransport>(
    shared: &Shared<T>,
    peer_id: &PeerId,
    conn_id: ConnectionId,
    channel: ChannelKind,
    data: &[u8],
) -> Step {
    let envelope = match decode_envelope(&shared.codec, data) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(%peer_id, %channel, error = %e, "dropping malformed envelope");
            return Step::Continue;
        }
    };

    let peers = shared.peers.lock().await;
    match peers.get(peer_id) {
        Some(slot) if slot.conn.id() == conn_id => {
            shared.publish_message(MessageEvent {
                from: peer_id.clone(),
                correlation_id: envelope.id,
                payload: envelope.payload,
                channel,
            });
            Step::Continue
        }
        Some(slot) => {
            tracing::error!(
                %peer_id,
                %conn_id,
                registered = %slot.conn.id(),
                "message on unregistered connection, aborting connection"
            );
            Step::Stop
        }
        None => Step::Stop,
    }
}
