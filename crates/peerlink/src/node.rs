//! `Node` builder and the collaborator-facing API.
//!
//! A node ties together all the layers for one local peer:
//! transport → session → chat + relay, with a dispatcher task feeding
//! inbound session events to chat and relay.

use std::sync::{Mutex, PoisonError};

use peerlink_chat::{ChatConfig, ChatEvent, SecureChat};
use peerlink_crypto::KeyPair;
use peerlink_protocol::{PeerId, Vector3, WorldAction};
use peerlink_relay::{GameEvent, GameRelay, RelayConfig};
use peerlink_session::{PeerEvents, PeerSessionManager, SessionConfig, generate_peer_id};
use peerlink_transport::{MemoryNetwork, MemoryTransport, PeerTransport};
#[cfg(feature = "webrtc")]
use peerlink_transport::{Signaler, WebRtcConfig, WebRtcTransport};
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::dispatch::spawn_dispatcher;
use crate::{NodeConfig, PeerlinkError};

/// Builder for configuring and starting a [`Node`].
///
/// # Example
///
/// ```rust,ignore
/// use peerlink::prelude::*;
///
/// let network = MemoryNetwork::new();
/// let node = Node::builder()
///     .config(NodeConfig::from_json(r#"{"chat": {"key_bits": 2048}}"#)?)
///     .build_in_memory(&network)?;
/// ```
#[derive(Default)]
pub struct NodeBuilder {
    config: NodeConfig,
    peer_id: Option<PeerId>,
    key_pair: Option<KeyPair>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    pub fn chat_config(mut self, config: ChatConfig) -> Self {
        self.config.chat = config;
        self
    }

    pub fn relay_config(mut self, config: RelayConfig) -> Self {
        self.config.relay = config;
        self
    }

    /// Uses a fixed peer id instead of generating one. Only honored by
    /// [`build_in_memory`](Self::build_in_memory); other transports carry
    /// their own identity.
    pub fn peer_id(mut self, peer_id: impl Into<PeerId>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    /// Uses an existing key pair instead of generating one at startup.
    pub fn key_pair(mut self, keys: KeyPair) -> Self {
        self.key_pair = Some(keys);
        self
    }

    /// Starts a node on `transport`. The node's peer id is the transport's
    /// local id.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build<T: PeerTransport>(self, transport: T) -> Node<T> {
        let session = PeerSessionManager::start(transport, self.config.session);
        let chat = match self.key_pair {
            Some(keys) => SecureChat::with_key_pair(session.clone(), self.config.chat, keys),
            None => SecureChat::new(session.clone(), self.config.chat),
        };
        let relay = GameRelay::new(session.clone(), self.config.relay);
        let (stop, stop_rx) = watch::channel(false);
        let dispatcher =
            spawn_dispatcher(session.subscribe(), stop_rx, chat.clone(), relay.clone());

        tracing::info!(peer_id = %session.local_id(), "node started");
        Node {
            session,
            chat,
            relay,
            stop,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Registers an endpoint on `network` and starts a node on it.
    ///
    /// The id is the one set with [`peer_id`](Self::peer_id), or a fresh
    /// one with the session's `id_prefix`.
    ///
    /// # Errors
    /// [`PeerlinkError::Transport`] if the id is already taken on
    /// `network`.
    pub fn build_in_memory(
        mut self,
        network: &MemoryNetwork,
    ) -> Result<Node<MemoryTransport>, PeerlinkError> {
        let peer_id = self
            .peer_id
            .take()
            .unwrap_or_else(|| generate_peer_id(&self.config.session.id_prefix));
        let transport = network.endpoint(peer_id.as_str())?;
        Ok(self.build(transport))
    }

    /// Starts a node on a WebRTC transport. The node's peer id is the
    /// signaler's local id; [`peer_id`](Self::peer_id) is ignored.
    ///
    /// Must be called from within a Tokio runtime.
    #[cfg(feature = "webrtc")]
    pub fn build_webrtc<S: Signaler>(
        self,
        signaler: S,
        rtc: WebRtcConfig,
    ) -> Node<WebRtcTransport<S>> {
        self.build(WebRtcTransport::new(signaler, rtc))
    }
}

/// A running local peer.
///
/// Dropping the node stops its dispatcher; once no other handle to the
/// session is left, its connections close and the peer id is free again.
pub struct Node<T: PeerTransport> {
    session: PeerSessionManager<T>,
    chat: SecureChat<T>,
    relay: GameRelay<T>,
    stop: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Node<MemoryTransport> {
    /// Shorthand for `NodeBuilder::new()`.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }
}

impl<T: PeerTransport> Node<T> {
    pub fn local_id(&self) -> &PeerId {
        self.session.local_id()
    }

    pub fn session(&self) -> &PeerSessionManager<T> {
        &self.session
    }

    pub fn chat(&self) -> &SecureChat<T> {
        &self.chat
    }

    pub fn relay(&self) -> &GameRelay<T> {
        &self.relay
    }

    // -- Inbound from collaborators ---------------------------------------

    /// Starts connecting to a peer. The outcome arrives on
    /// [`peer_events`](Self::peer_events).
    ///
    /// # Errors
    /// [`PeerlinkError::Session`] for an empty id or our own id.
    pub async fn connect_to_peer(&self, peer_id: &PeerId) -> Result<(), PeerlinkError> {
        self.session.connect_to_peer(peer_id).await?;
        Ok(())
    }

    pub async fn disconnect_peer(&self, peer_id: &PeerId) {
        self.session.disconnect_peer(peer_id).await;
    }

    /// Encrypts and sends a chat message to every peer whose key we hold.
    /// Returns the number of recipients.
    ///
    /// # Errors
    /// [`PeerlinkError::Chat`] if the message is too long or chat is
    /// disabled.
    pub async fn send_chat_message(&self, text: &str) -> Result<usize, PeerlinkError> {
        Ok(self.chat.send_chat_message(text).await?)
    }

    pub async fn send_world_action(&self, action: &WorldAction) -> Result<(), PeerlinkError> {
        self.relay.send_world_action(action).await?;
        Ok(())
    }

    pub async fn send_player_position(&self, position: Vector3) -> Result<(), PeerlinkError> {
        self.relay.send_player_position(position).await?;
        Ok(())
    }

    /// Broadcasts `source` periodically; see
    /// [`GameRelay::spawn_position_ticker`].
    pub fn spawn_position_ticker(
        &self,
        source: watch::Receiver<Vector3>,
    ) -> Result<AbortHandle, PeerlinkError> {
        Ok(self.relay.spawn_position_ticker(source)?.abort_handle())
    }

    // -- Outbound to collaborators ----------------------------------------

    pub fn peer_events(&self) -> PeerEvents {
        self.session.subscribe_peer_events()
    }

    pub fn chat_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.chat.subscribe()
    }

    pub fn game_events(&self) -> broadcast::Receiver<GameEvent> {
        self.relay.subscribe()
    }

    /// Ready peers, sorted.
    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.session.peer_ids().await
    }

    pub fn chat_history(&self) -> Vec<ChatEvent> {
        self.chat.history()
    }

    /// Closes every connection and stops the dispatcher.
    ///
    /// Chat has seen every departure by the time this returns.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
        self.stop.send_replace(true);
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                tracing::warn!(error = %e, "dispatcher ended abnormally");
            }
        }
        tracing::info!(peer_id = %self.local_id(), "node stopped");
    }
}

impl<T: PeerTransport> Drop for Node<T> {
    fn drop(&mut self) {
        let dispatcher = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
    }
}
