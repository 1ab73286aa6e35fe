//! The secure chat session: handshake, fan-out encryption, decryption.
//!
//! Every peer shares its public key once, on the guaranteed channel, as
//! soon as the session layer reports it ready. Outgoing messages are
//! sealed separately for each registered recipient, so one recipient's
//! ciphertext tells another nothing.
//!
//! Handshakes and chat messages travel as independent flows. A message
//! can reach a peer before that peer has our key (or before we have
//! theirs); it is then dropped. Nothing is retried.
//!
//! Received messages are opened by a per-session inbox task, one at a
//! time in arrival order. Whoever feeds session events in (the node's
//! dispatcher) therefore never waits on the local key pair or on an RSA
//! decryption, and game traffic behind a chat message is not held up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::join_all;
use peerlink_crypto::{CryptoError, Jwk, KeyPair, PublicKey};
use peerlink_protocol::{ChatPayload, PeerId, parse_payload};
use peerlink_session::{Delivery, PeerEvent, PeerSessionManager, SessionEvent};
use peerlink_transport::PeerTransport;
use tokio::sync::{broadcast, mpsc};

use crate::events::ChatHistory;
use crate::keys::{KeyProvider, KeyRegistry, LocalKeys};
use crate::{ChatConfig, ChatError, ChatEvent};

/// A received ciphertext addressed to us, waiting to be opened.
struct Sealed {
    from: PeerId,
    ciphertext: String,
}

struct Inner<T: PeerTransport> {
    session: PeerSessionManager<T>,
    keys: LocalKeys,
    registry: KeyRegistry,
    history: Mutex<ChatHistory>,
    events: broadcast::Sender<ChatEvent>,
    inbox: mpsc::UnboundedSender<Sealed>,
}

/// End-to-end encrypted chat on top of a [`PeerSessionManager`].
///
/// Cheap to clone; clones share keys, registry and event feed.
///
/// ## Lifecycle of a peer
///
/// ```text
///   session: Added ──→ on_peer_added ──→ our handshake (guaranteed channel)
///   remote handshake ──→ on_handshake_received ──→ key registered, PeerJoined
///   session: Removed ──→ on_peer_removed ──→ key forgotten, PeerLeft
/// ```
///
/// A peer can only be written to once its handshake has been accepted,
/// and only reads what was sealed with our key. Nothing else about the
/// peer is kept.
///
/// ## Why keys are awaited, not required
///
/// RSA key generation takes from tens of milliseconds to seconds, and a
/// node should be able to connect before it finishes. Every operation
/// that needs the local key pair awaits a one-shot gate instead.
/// Handshakes are sent from their own task and received messages queue in
/// the inbox, so [`send_chat_message`](Self::send_chat_message) is the
/// only call that takes longer. If the keys never arrive, waiters fail
/// with [`ChatError::KeysUnavailable`] rather than hang.
pub struct SecureChat<T: PeerTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: PeerTransport> Clone for SecureChat<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PeerTransport> SecureChat<T> {
    /// Creates a chat session and starts generating its key pair in the
    /// background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(session: PeerSessionManager<T>, config: ChatConfig) -> Self {
        let config = config.validated();
        let keys = LocalKeys::generate(config.key_bits);
        Self::build(session, &config, keys)
    }

    /// Creates a chat session around an existing key pair.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_key_pair(
        session: PeerSessionManager<T>,
        config: ChatConfig,
        keys: KeyPair,
    ) -> Self {
        Self::build(session, &config.validated(), LocalKeys::ready(keys))
    }

    /// Creates a chat session whose key pair is supplied later through the
    /// returned [`KeyProvider`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_deferred_keys(
        session: PeerSessionManager<T>,
        config: ChatConfig,
    ) -> (Self, KeyProvider) {
        let (keys, provider) = LocalKeys::deferred();
        (Self::build(session, &config.validated(), keys), provider)
    }

    fn build(session: PeerSessionManager<T>, config: &ChatConfig, keys: LocalKeys) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (inbox, sealed) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            session,
            keys,
            registry: KeyRegistry::default(),
            history: Mutex::new(ChatHistory::new(config.history_limit, config.history_trim)),
            events,
            inbox,
        });
        tokio::spawn(open_inbox(Arc::downgrade(&inner), sealed));
        Self { inner }
    }

    pub fn local_id(&self) -> &PeerId {
        self.inner.session.local_id()
    }

    /// Waits until the local key pair exists.
    ///
    /// # Errors
    /// [`ChatError::KeysUnavailable`] if generation failed.
    pub async fn wait_for_keys(&self) -> Result<(), ChatError> {
        self.inner.keys.wait().await.map(|_| ())
    }

    /// Subscribes to chat events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    /// The local message log, oldest first.
    pub fn history(&self) -> Vec<ChatEvent> {
        self.history_lock().snapshot()
    }

    /// Peers whose public key we hold, sorted.
    pub async fn known_peers(&self) -> Vec<PeerId> {
        self.inner.registry.peer_ids().await
    }

    // -- Peer lifecycle ---------------------------------------------------

    /// Sends our public key to a newly ready peer on the guaranteed
    /// channel. Waits for the local key pair first.
    ///
    /// # Errors
    /// [`ChatError::KeysUnavailable`] if there is no key pair to share.
    pub async fn on_peer_added(&self, peer_id: &PeerId) -> Result<(), ChatError> {
        let keys = self.inner.keys.wait().await?;
        let handshake = ChatPayload::Handshake {
            public_key: keys.public_jwk().to_json_object(),
        };
        self.inner
            .session
            .send_to_peer(peer_id, &handshake, Delivery::Guaranteed)
            .await?;
        tracing::debug!(%peer_id, "handshake sent");
        Ok(())
    }

    /// Registers a peer's public key. Trust on first use: the first key
    /// presented under an id is kept, later ones are ignored without being
    /// imported.
    ///
    /// Returns `true` if the peer was newly registered.
    ///
    /// # Errors
    /// [`ChatError::KeyImport`] if the key is malformed or not an
    /// RSA-OAEP-256 public key.
    pub async fn on_handshake_received(
        &self,
        peer_id: &PeerId,
        public_key: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool, ChatError> {
        if self.inner.registry.contains(peer_id).await {
            tracing::debug!(%peer_id, "duplicate handshake ignored");
            return Ok(false);
        }

        let key = import_key(public_key).map_err(|source| ChatError::KeyImport {
            peer_id: peer_id.clone(),
            source,
        })?;
        if !self.inner.registry.insert_if_absent(peer_id.clone(), key).await {
            return Ok(false);
        }

        tracing::info!(%peer_id, "peer joined chat");
        self.record(ChatEvent::joined(peer_id.clone()));
        Ok(true)
    }

    /// Forgets a departed peer's key. Emits [`ChatEvent::PeerLeft`] only
    /// for peers that had joined.
    pub async fn on_peer_removed(&self, peer_id: &PeerId) {
        if self.inner.registry.remove(peer_id).await {
            tracing::info!(%peer_id, "peer left chat");
            self.record(ChatEvent::left(peer_id.clone()));
        }
    }

    // -- Encryption -------------------------------------------------------

    /// Seals `plaintext` separately for every registered peer.
    ///
    /// The encryptions run concurrently on the blocking pool. A recipient
    /// whose encryption fails for any reason other than length is left out
    /// of the result (and logged).
    ///
    /// # Errors
    /// - [`ChatError::KeysUnavailable`] if the local key pair failed.
    /// - [`ChatError::MessageTooLong`] if `plaintext` exceeds the OAEP
    ///   limit of any recipient's key.
    pub async fn encrypt_for_all_known_peers(
        &self,
        plaintext: &str,
    ) -> Result<HashMap<PeerId, String>, ChatError> {
        self.inner.keys.wait().await?;

        let recipients = self.inner.registry.snapshot().await;
        let plaintext: Arc<[u8]> = Arc::from(plaintext.as_bytes());

        let sealed = join_all(recipients.into_iter().map(|(peer_id, key)| {
            let plaintext = Arc::clone(&plaintext);
            async move {
                let result =
                    tokio::task::spawn_blocking(move || peerlink_crypto::seal(&key, &plaintext))
                        .await;
                (peer_id, result)
            }
        }))
        .await;

        let mut out = HashMap::with_capacity(sealed.len());
        for (peer_id, result) in sealed {
            match result {
                Ok(Ok(ciphertext)) => {
                    out.insert(peer_id, ciphertext);
                }
                Ok(Err(CryptoError::MessageTooLong { len, max })) => {
                    return Err(ChatError::MessageTooLong { len, max });
                }
                Ok(Err(e)) => {
                    tracing::warn!(%peer_id, error = %e, "encryption failed, skipping recipient");
                }
                Err(e) => {
                    tracing::warn!(%peer_id, error = %e, "encryption task failed, skipping recipient");
                }
            }
        }
        Ok(out)
    }

    /// Opens a ciphertext addressed to us.
    ///
    /// # Errors
    /// [`ChatError::DecryptionFailed`] for bad base64, bad compression,
    /// the wrong key, or non-UTF-8 plaintext. The caller should drop the
    /// message.
    pub async fn decrypt_from_peer(&self, ciphertext: &str) -> Result<String, ChatError> {
        let keys = self.inner.keys.wait().await?;
        let ciphertext = ciphertext.to_owned();

        let plaintext = tokio::task::spawn_blocking(move || peerlink_crypto::open(&keys, &ciphertext))
            .await
            .map_err(|_| ChatError::DecryptionFailed)?
            .map_err(|e| {
                tracing::debug!(error = %e, "open failed");
                ChatError::DecryptionFailed
            })?;

        String::from_utf8(plaintext).map_err(|_| ChatError::DecryptionFailed)
    }

    // -- Sending ----------------------------------------------------------

    /// Encrypts `text` for every known peer and sends each peer its own
    /// ciphertext on the guaranteed channel, then echoes the message
    /// locally.
    ///
    /// Returns how many peers it was sent to. With no known peers the
    /// message is only echoed.
    ///
    /// # Errors
    /// Same as [`encrypt_for_all_known_peers`](Self::encrypt_for_all_known_peers);
    /// nothing is sent or echoed on error.
    pub async fn send_chat_message(&self, text: &str) -> Result<usize, ChatError> {
        let ciphertexts = self.encrypt_for_all_known_peers(text).await?;
        let recipients = ciphertexts.len();

        for (peer_id, ciphertext) in ciphertexts {
            let payload = ChatPayload::Message {
                message: HashMap::from([(peer_id.clone(), ciphertext)]),
            };
            if let Err(e) = self
                .inner
                .session
                .send_to_peer(&peer_id, &payload, Delivery::Guaranteed)
                .await
            {
                tracing::warn!(%peer_id, error = %e, "failed to send chat message");
            }
        }

        tracing::debug!(recipients, "chat message sent");
        self.record(ChatEvent::message(self.local_id().clone(), text.to_owned()));
        Ok(recipients)
    }

    // -- Receiving --------------------------------------------------------

    /// Handles a chat payload received from `from`.
    ///
    /// A handshake is registered before this returns. A message is only
    /// queued: it is opened on the inbox task and shows up on the event
    /// feed once decrypted. Failures are logged and the payload dropped;
    /// nothing is returned to the caller.
    pub async fn handle_payload(&self, from: &PeerId, payload: ChatPayload) {
        match payload {
            ChatPayload::Handshake { public_key } => {
                if let Err(e) = self.on_handshake_received(from, &public_key).await {
                    tracing::warn!(peer_id = %from, error = %e, "rejected handshake");
                }
            }
            message @ ChatPayload::Message { .. } => {
                let Some(ciphertext) = message.ciphertext_for(self.local_id()) else {
                    tracing::debug!(peer_id = %from, "chat message has no entry for us, dropping");
                    return;
                };
                let sealed = Sealed {
                    from: from.clone(),
                    ciphertext: ciphertext.to_owned(),
                };
                if self.inner.inbox.send(sealed).is_err() {
                    tracing::debug!(peer_id = %from, "chat inbox closed, dropping message");
                }
            }
        }
    }

    /// Reacts to one session event: handshakes new peers, forgets departed
    /// ones, and consumes chat payloads.
    ///
    /// Returns `true` if the event was a chat message (so other consumers
    /// can skip it). Never waits on the local key pair: the handshake to a
    /// new peer is sent from its own task and messages go to the inbox.
    pub async fn handle_session_event(&self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::Peer(PeerEvent::Added(peer_id)) => {
                let chat = self.clone();
                let peer_id = peer_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = chat.on_peer_added(&peer_id).await {
                        tracing::warn!(%peer_id, error = %e, "handshake not sent");
                    }
                });
                false
            }
            SessionEvent::Peer(PeerEvent::Removed(peer_id)) => {
                self.on_peer_removed(peer_id).await;
                false
            }
            SessionEvent::Message(message) => match parse_payload::<ChatPayload>(&message.payload) {
                Ok(payload) => {
                    self.handle_payload(&message.from, payload).await;
                    true
                }
                Err(_) => false,
            },
        }
    }

    fn record(&self, event: ChatEvent) {
        self.history_lock().push(event.clone());
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn history_lock(&self) -> MutexGuard<'_, ChatHistory> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Opens queued messages in arrival order until the session is gone.
async fn open_inbox<T: PeerTransport>(
    inner: Weak<Inner<T>>,
    mut sealed: mpsc::UnboundedReceiver<Sealed>,
) {
    while let Some(Sealed { from, ciphertext }) = sealed.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let chat = SecureChat { inner };
        match chat.decrypt_from_peer(&ciphertext).await {
            Ok(text) => chat.record(ChatEvent::message(from, text)),
            Err(e) => {
                tracing::warn!(peer_id = %from, error = %e, "dropping undecryptable chat message");
            }
        }
    }
}

fn import_key(
    object: &serde_json::Map<String, serde_json::Value>,
) -> Result<PublicKey, CryptoError> {
    PublicKey::from_jwk(&Jwk::from_json_object(object)?)
}
