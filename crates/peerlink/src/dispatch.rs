//! Inbound dispatch: routes session events to the chat and relay layers.
//!
//! One task per node reads the session's ordered event feed, so chat
//! handles a peer's removal after every message that peer sent before it.
//! Each message is offered to chat first, then to the relay; payloads
//! neither recognizes are dropped. Chat only queues what it receives, so a
//! slow decryption never holds up the game traffic behind it.
//!
//! On stop the task drains what is already on the feed before exiting, so
//! departures published by a shutdown still reach chat.

use peerlink_chat::SecureChat;
use peerlink_relay::GameRelay;
use peerlink_session::SessionEvent;
use peerlink_transport::PeerTransport;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub(crate) fn spawn_dispatcher<T: PeerTransport>(
    mut events: broadcast::Receiver<SessionEvent>,
    mut stop: watch::Receiver<bool>,
    chat: SecureChat<T>,
    relay: GameRelay<T>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                biased;
                received = events.recv() => received,
                _ = stop.changed() => break,
            };
            let event = match received {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "dispatcher fell behind, session events lost");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            dispatch(&event, &chat, &relay).await;
        }

        loop {
            match events.try_recv() {
                Ok(event) => dispatch(&event, &chat, &relay).await,
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "dispatcher fell behind, session events lost");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        tracing::debug!("dispatcher stopped");
    })
}

async fn dispatch<T: PeerTransport>(
    event: &SessionEvent,
    chat: &SecureChat<T>,
    relay: &GameRelay<T>,
) {
    if chat.handle_session_event(event).await {
        return;
    }
    if relay.handle_session_event(event) {
        return;
    }
    if let SessionEvent::Message(message) = event {
        tracing::debug!(peer_id = %message.from, "unrecognized payload, dropping");
    }
}
