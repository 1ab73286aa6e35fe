//! Game-state relay: broadcasts world actions and player positions on the
//! default channel and hands received game payloads to the consumer.
//!
//! Game traffic is fire-and-forget. A stale position is better than a
//! late one, so nothing here waits on the guaranteed channel.

use std::sync::Arc;
use std::time::Duration;

use peerlink_protocol::{GamePayload, PeerId, Vector3, WorldAction, parse_payload};
use peerlink_session::{Delivery, PeerSessionManager, SessionEvent};
use peerlink_transport::PeerTransport;
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::{GameEvent, RelayConfig, RelayError};

struct Inner<T: PeerTransport> {
    session: PeerSessionManager<T>,
    config: RelayConfig,
    events: broadcast::Sender<GameEvent>,
}

/// Game-state relay on top of a [`PeerSessionManager`].
///
/// Cheap to clone; clones share the event feed.
pub struct GameRelay<T: PeerTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: PeerTransport> Clone for GameRelay<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PeerTransport> GameRelay<T> {
    pub fn new(session: PeerSessionManager<T>, config: RelayConfig) -> Self {
        let config = config.validated();
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                session,
                config,
                events,
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Broadcasts a world action to every ready peer.
    pub async fn send_world_action(&self, action: &WorldAction) -> Result<(), RelayError> {
        self.broadcast(&GamePayload::WorldAction(action.clone())).await
    }

    /// Broadcasts our position to every ready peer.
    pub async fn send_player_position(&self, position: Vector3) -> Result<(), RelayError> {
        self.broadcast(&GamePayload::PlayerPosition(position)).await
    }

    async fn broadcast(&self, payload: &GamePayload) -> Result<(), RelayError> {
        self.inner
            .session
            .send_to_peers(payload, Delivery::BestEffort)
            .await?;
        Ok(())
    }

    /// Subscribes to received game payloads. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.inner.events.subscribe()
    }

    /// Publishes a game payload received from `from`.
    pub fn handle_payload(&self, from: &PeerId, payload: GamePayload) {
        tracing::trace!(peer_id = %from, ?payload, "game payload");
        let _ = self.inner.events.send(GameEvent {
            from: from.clone(),
            payload,
        });
    }

    /// Consumes a session message if it carries a game payload.
    ///
    /// Returns `true` if it did.
    pub fn handle_session_event(&self, event: &SessionEvent) -> bool {
        let SessionEvent::Message(message) = event else {
            return false;
        };
        match parse_payload::<GamePayload>(&message.payload) {
            Ok(payload) => {
                self.handle_payload(&message.from, payload);
                true
            }
            Err(_) => false,
        }
    }

    /// Spawns a task that broadcasts the latest value of `source` at
    /// `position_rate_hz`, skipping ticks where it has not changed since
    /// the last broadcast.
    ///
    /// Missed ticks are skipped rather than replayed. The first tick is
    /// delayed by up to `initial_jitter_ms`. The task ends when the
    /// sender side of `source` is dropped; abort the handle to stop it
    /// earlier.
    ///
    /// # Errors
    /// [`RelayError::TickerDisabled`] if the rate is 0.
    pub fn spawn_position_ticker(
        &self,
        mut source: watch::Receiver<Vector3>,
    ) -> Result<JoinHandle<()>, RelayError> {
        let period = self
            .inner
            .config
            .position_interval()
            .ok_or(RelayError::TickerDisabled)?;
        let jitter = initial_jitter(self.inner.config.initial_jitter_ms);
        let relay = self.clone();

        tracing::debug!(?period, ?jitter, "position ticker started");
        Ok(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + jitter, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_sent: Option<Vector3> = None;

            loop {
                interval.tick().await;
                if source.has_changed().is_err() {
                    tracing::debug!("position source dropped, ticker stopping");
                    break;
                }
                let position = *source.borrow_and_update();
                if last_sent == Some(position) {
                    continue;
                }
                if let Err(e) = relay.send_player_position(position).await {
                    tracing::warn!(error = %e, "position broadcast failed");
                    continue;
                }
                last_sent = Some(position);
            }
        }))
    }
}

fn initial_jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::rng().random_range(0..max_ms))
    }
}
