//! The peer session manager: owns every peer connection.
//!
//! Responsibilities:
//! - Dialing peers and accepting their dials
//! - Deciding which connection wins when a peer has two
//! - Gating peers until both channels are open
//! - Routing outbound payloads to the right channel
//! - Publishing peer and message events
//!
//! # Concurrency
//!
//! The peer map lives behind one `tokio::sync::Mutex` owned by the manager
//! and is never handed out. Each connection is driven by its own task (see
//! `driver.rs`); those tasks, the accept loop and shutdown are the only
//! writers.
//! Transport I/O never happens while the map is locked.

use std::collections::HashMap;
use std::sync::Arc;

use peerlink_protocol::{Codec, Envelope, JsonCodec, PeerId, ProtocolError};
use peerlink_transport::{ChannelKind, PeerConnection, PeerTransport};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::{AbortHandle, JoinHandle};

use crate::driver::drive_connection;
use crate::events::{Delivery, MessageEvent, Messages, PeerEvent, PeerEvents, SessionEvent};
use crate::identity::correlation_id;
use crate::session::{
    Admission, PeerLifecycle, PeerState, SessionConfig, admit, initiator,
};
use crate::SessionError;

/// A registered connection for one peer id.
pub(crate) struct Slot<C> {
    pub(crate) conn: Arc<C>,
    pub(crate) initiator: PeerId,
    pub(crate) lifecycle: PeerLifecycle,
    pub(crate) driver: Option<AbortHandle>,
}

/// State shared between the manager handle, the accept loop, and the
/// per-connection drivers.
pub(crate) struct Shared<T: PeerTransport> {
    pub(crate) transport: T,
    pub(crate) local_id: PeerId,
    pub(crate) config: SessionConfig,
    pub(crate) codec: JsonCodec,
    pub(crate) peers: Mutex<HashMap<PeerId, Slot<T::Connection>>>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: PeerTransport> Shared<T> {
    pub(crate) fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn publish_peer(&self, event: PeerEvent) {
        self.publish(SessionEvent::Peer(event));
    }

    pub(crate) fn publish_message(&self, event: MessageEvent) {
        self.publish(SessionEvent::Message(event));
    }

    /// Registers a fresh connection (dialed or accepted) and starts its
    /// driver, unless a better connection for the same peer already exists.
    pub(crate) async fn admit(self: &Arc<Self>, conn: T::Connection) {
        let conn = Arc::new(conn);
        let conn_id = conn.id();
        let peer_id = PeerId::from(conn.remote_id());

        if peer_id.is_empty() || peer_id == self.local_id {
            tracing::warn!(%conn_id, %peer_id, "rejecting connection with invalid peer id");
            conn.close().await;
            return;
        }

        let incoming_initiator =
            PeerId::from(initiator(self.local_id.as_str(), peer_id.as_str(), conn.direction()));

        let displaced = {
            let mut peers = self.peers.lock().await;
            let registered = peers
                .get(&peer_id)
                .map(|slot| (slot.lifecycle.state(), slot.initiator.as_str()));

            let displaced = match admit(registered, incoming_initiator.as_str(), conn.direction()) {
                Admission::Reject => {
                    drop(peers);
                    tracing::debug!(%conn_id, %peer_id, "duplicate connection rejected");
                    conn.close().await;
                    return;
                }
                Admission::Replace => peers.remove(&peer_id).map(|mut old| {
                    // Stop the old driver before anyone else can take the
                    // lock, so it never sees the new slot.
                    if let Some(driver) = old.driver.take() {
                        driver.abort();
                    }
                    old.lifecycle.close();
                    if old.lifecycle.reached_ready() {
                        tracing::info!(%peer_id, conn_id = %old.conn.id(), "peer removed");
                        self.publish_peer(PeerEvent::Removed(peer_id.clone()));
                    }
                    old
                }),
                Admission::Accept => None,
            };

            let driver = tokio::spawn(drive_connection(Arc::clone(self), Arc::clone(&conn)));
            peers.insert(
                peer_id.clone(),
                Slot {
                    conn: Arc::clone(&conn),
                    initiator: incoming_initiator,
                    lifecycle: PeerLifecycle::new(),
                    driver: Some(driver.abort_handle()),
                },
            );
            displaced
        };

        tracing::debug!(%conn_id, %peer_id, direction = ?conn.direction(), "connection registered");

        if let Some(old) = displaced {
            tracing::debug!(
                old_conn_id = %old.conn.id(),
                new_conn_id = %conn_id,
                %peer_id,
                "connection superseded"
            );
            old.conn.close().await;
        }
    }

    /// Removes the slot if `conn` still owns it, announces the departure
    /// of an announced peer, and closes the connection.
    pub(crate) async fn release(&self, peer_id: &PeerId, conn: &T::Connection) {
        let conn_id = conn.id();
        {
            let mut peers = self.peers.lock().await;
            let owned = peers
                .get(peer_id)
                .is_some_and(|slot| slot.conn.id() == conn_id);
            if owned {
                if let Some(mut slot) = peers.remove(peer_id) {
                    slot.lifecycle.close();
                    if slot.lifecycle.reached_ready() {
                        tracing::info!(%peer_id, %conn_id, "peer removed");
                        self.publish_peer(PeerEvent::Removed(peer_id.clone()));
                    }
                }
            }
        }
        conn.close().await;
    }

    /// Empties the peer map: stops every driver and announces each ready
    /// peer's departure. Returns the connections, still to be closed.
    fn evict_all(
        &self,
        peers: &mut HashMap<PeerId, Slot<T::Connection>>,
    ) -> Vec<Arc<T::Connection>> {
        peers
            .drain()
            .map(|(peer_id, mut slot)| {
                if let Some(driver) = slot.driver.take() {
                    driver.abort();
                }
                slot.lifecycle.close();
                if slot.lifecycle.reached_ready() {
                    tracing::info!(%peer_id, conn_id = %slot.conn.id(), "peer removed");
                    self.publish_peer(PeerEvent::Removed(peer_id));
                }
                slot.conn
            })
            .collect()
    }

    fn stop_accepting(&self) {
        let task = match self.accept_task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn ready_connection(&self, peer_id: &PeerId) -> Option<Arc<T::Connection>> {
        let peers = self.peers.lock().await;
        peers
            .get(peer_id)
            .filter(|slot| slot.lifecycle.state() == PeerState::Ready)
            .map(|slot| Arc::clone(&slot.conn))
    }

    async fn send_value(
        &self,
        peer_id: &PeerId,
        payload: serde_json::Value,
        delivery: Delivery,
    ) -> Result<(), SessionError> {
        let Some(conn) = self.ready_connection(peer_id).await else {
            tracing::debug!(%peer_id, "send to unknown or unready peer dropped");
            return Ok(());
        };

        let (envelope, channel) = match delivery {
            Delivery::Guaranteed if conn.is_open(ChannelKind::Guaranteed) => (
                Envelope::correlated(correlation_id(), payload),
                ChannelKind::Guaranteed,
            ),
            _ => (Envelope::best_effort(payload), ChannelKind::Default),
        };
        let bytes = self.codec.encode(&envelope)?;

        if let Err(e) = conn.send(channel, &bytes).await {
            tracing::debug!(%peer_id, %channel, error = %e, "send failed, message dropped");
        }
        Ok(())
    }
}

/// Handle to a running session manager.
///
/// Cheap to clone; clones share the same peers and event feeds. When the
/// last handle is dropped the accept loop and every connection driver are
/// stopped, which releases the transport (and with it the local id).
///
/// ## Trait bounds explained
///
/// `T: PeerTransport` already implies `Send + Sync + 'static`. The manager
/// needs all three: the transport sits in an `Arc` shared with the accept
/// loop and one driver task per connection, and those tasks run on the
/// multi-threaded runtime for as long as the connection lives. Connections
/// are likewise shared as `Arc<T::Connection>` between a driver and the
/// send path, so nothing here requires `Clone` on the transport itself.
///
/// ## Why two layers of `Arc`
///
/// The background tasks keep `Shared` alive, so its reference count never
/// reaches zero while they run. Handles therefore also share an `Owner`
/// that the tasks never see; its drop is the signal that nobody can reach
/// the manager anymore and the tasks should stop.
pub struct PeerSessionManager<T: PeerTransport> {
    shared: Arc<Shared<T>>,
    _owner: Arc<Owner<T>>,
}

impl<T: PeerTransport> Clone for PeerSessionManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _owner: Arc::clone(&self._owner),
        }
    }
}

/// Held only by [`PeerSessionManager`] handles.
struct Owner<T: PeerTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: PeerTransport> Drop for Owner<T> {
    fn drop(&mut self) {
        self.shared.stop_accepting();
        // Dropping the evicted slots drops their connections once the
        // aborted drivers let go of them.
        if let Ok(mut peers) = self.shared.peers.try_lock() {
            drop(self.shared.evict_all(&mut peers));
            return;
        }
        // A driver holds the lock right now; finish on the runtime.
        let shared = Arc::clone(&self.shared);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let mut peers = shared.peers.lock().await;
                drop(shared.evict_all(&mut peers));
            });
        }
    }
}

impl<T: PeerTransport> PeerSessionManager<T> {
    /// Starts managing peers reachable through `transport`.
    ///
    /// Spawns the accept loop, so this must be called from within a Tokio
    /// runtime.
    pub fn start(transport: T, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let local_id = PeerId::from(transport.local_id());
        let shared = Arc::new(Shared {
            transport,
            local_id,
            config,
            codec: JsonCodec,
            peers: Mutex::new(HashMap::new()),
            events,
            accept_task: std::sync::Mutex::new(None),
        });

        let accept = tokio::spawn(accept_loop(Arc::clone(&shared)));
        if let Ok(mut slot) = shared.accept_task.lock() {
            *slot = Some(accept);
        }

        tracing::info!(local_id = %shared.local_id, "peer session manager started");
        Self {
            _owner: Arc::new(Owner {
                shared: Arc::clone(&shared),
            }),
            shared,
        }
    }

    /// This peer's identity.
    pub fn local_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Starts an outbound connection to `remote_id`.
    ///
    /// Success is reported only through [`PeerEvent::Added`]. A transport
    /// failure is logged and otherwise silent; nothing is retried. Dialing
    /// a peer that already has a connection is a no-op.
    ///
    /// # Errors
    /// [`SessionError::InvalidPeerId`] for an empty id or the local id.
    pub async fn connect_to_peer(&self, remote_id: &PeerId) -> Result<(), SessionError> {
        if remote_id.is_empty() || remote_id == &self.shared.local_id {
            return Err(SessionError::InvalidPeerId(remote_id.to_string()));
        }
        if self.shared.peers.lock().await.contains_key(remote_id) {
            tracing::debug!(peer_id = %remote_id, "already connected or connecting");
            return Ok(());
        }

        let guaranteed = self.shared.config.guaranteed_channel();
        match self
            .shared
            .transport
            .connect(remote_id.as_str(), &guaranteed)
            .await
        {
            Ok(conn) => {
                tracing::info!(peer_id = %remote_id, conn_id = %conn.id(), "dialing peer");
                self.shared.admit(conn).await;
            }
            Err(e) => {
                tracing::warn!(peer_id = %remote_id, error = %e, "connect failed");
            }
        }
        Ok(())
    }

    /// Sends `payload` to one ready peer.
    ///
    /// Unknown or not-yet-ready peers are skipped with a debug log, as are
    /// transport send failures.
    ///
    /// # Errors
    /// [`SessionError::Protocol`] only if `payload` cannot be serialized.
    pub async fn send_to_peer<P: Serialize + ?Sized>(
        &self,
        peer_id: &PeerId,
        payload: &P,
        delivery: Delivery,
    ) -> Result<(), SessionError> {
        let value = serde_json::to_value(payload).map_err(ProtocolError::Encode)?;
        self.shared.send_value(peer_id, value, delivery).await
    }

    /// Sends `payload` to every ready peer, one after another.
    ///
    /// The peer set is snapshotted once; a peer that leaves mid-broadcast
    /// is skipped like any other unreachable peer.
    pub async fn send_to_peers<P: Serialize + ?Sized>(
        &self,
        payload: &P,
        delivery: Delivery,
    ) -> Result<(), SessionError> {
        let value = serde_json::to_value(payload).map_err(ProtocolError::Encode)?;
        for peer_id in self.peer_ids().await {
            self.shared.send_value(&peer_id, value.clone(), delivery).await?;
        }
        Ok(())
    }

    /// Closes the connection to `peer_id`, if any. The departure is
    /// reported through the event feed once the connection winds down.
    pub async fn disconnect_peer(&self, peer_id: &PeerId) {
        let conn = {
            let peers = self.shared.peers.lock().await;
            peers.get(peer_id).map(|slot| Arc::clone(&slot.conn))
        };
        match conn {
            Some(conn) => {
                tracing::info!(%peer_id, conn_id = %conn.id(), "disconnecting peer");
                conn.close().await;
            }
            None => tracing::debug!(%peer_id, "disconnect of unknown peer ignored"),
        }
    }

    /// Ids of all ready peers, sorted.
    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let peers = self.shared.peers.lock().await;
        let mut ids: Vec<PeerId> = peers
            .iter()
            .filter(|(_, slot)| slot.lifecycle.state() == PeerState::Ready)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn is_ready(&self, peer_id: &PeerId) -> bool {
        self.peer_state(peer_id).await == Some(PeerState::Ready)
    }

    /// The state of `peer_id`'s registered connection, if there is one.
    pub async fn peer_state(&self, peer_id: &PeerId) -> Option<PeerState> {
        let peers = self.shared.peers.lock().await;
        peers.get(peer_id).map(|slot| slot.lifecycle.state())
    }

    /// Subscribes to every event in order.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Subscribes to peer add/remove events.
    pub fn subscribe_peer_events(&self) -> PeerEvents {
        PeerEvents::new(self.shared.events.subscribe())
    }

    /// Subscribes to validated inbound messages.
    pub fn subscribe_messages(&self) -> Messages {
        Messages::new(self.shared.events.subscribe())
    }

    /// Stops accepting connections and closes every open one.
    ///
    /// A [`PeerEvent::Removed`] for every ready peer is on the event feed
    /// before this returns, ahead of anything published afterwards.
    pub async fn shutdown(&self) {
        self.shared.stop_accepting();
        let conns = {
            let mut peers = self.shared.peers.lock().await;
            self.shared.evict_all(&mut peers)
        };
        for conn in conns {
            conn.close().await;
        }
        tracing::info!(local_id = %self.shared.local_id, "peer session manager shut down");
    }
}

async fn accept_loop<T: PeerTransport>(shared: Arc<Shared<T>>) {
    while let Some(conn) = shared.transport.accept().await {
        tracing::debug!(
            conn_id = %conn.id(),
            remote_id = %conn.remote_id(),
            "incoming connection"
        );
        shared.admit(conn).await;
    }
    tracing::debug!(local_id = %shared.local_id, "transport stopped accepting");
}
