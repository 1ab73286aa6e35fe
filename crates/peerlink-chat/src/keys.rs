//! The local key pair gate and the registry of remote public keys.

use std::collections::HashMap;
use std::sync::Arc;

use peerlink_crypto::{KeyPair, PublicKey};
use peerlink_protocol::PeerId;
use tokio::sync::{Mutex, watch};

use crate::ChatError;

#[derive(Clone)]
enum KeyState {
    Pending,
    Ready(Arc<KeyPair>),
    Failed,
}

/// Readiness gate around the local key pair.
///
/// The keys come from one generation run on the blocking pool or from a
/// [`KeyProvider`]. Everything that needs them awaits
/// [`wait`](Self::wait); nothing polls.
#[derive(Clone)]
pub(crate) struct LocalKeys {
    rx: watch::Receiver<KeyState>,
}

impl LocalKeys {
    /// Starts generating a key pair of `bits` in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn generate(bits: usize) -> Self {
        let (gate, provider) = Self::deferred();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || KeyPair::generate_with_bits(bits)).await;
            match result {
                Ok(Ok(keys)) => {
                    tracing::info!(bits, "local key pair ready");
                    provider.provide(keys);
                }
                // Dropping the provider closes the gate with an error.
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "key generation failed, chat disabled");
                }
                Err(e) => {
                    tracing::error!(error = %e, "key generation task failed, chat disabled");
                }
            }
        });
        gate
    }

    /// A closed gate and the handle that opens it.
    pub(crate) fn deferred() -> (Self, KeyProvider) {
        let (tx, rx) = watch::channel(KeyState::Pending);
        (Self { rx }, KeyProvider { tx })
    }

    /// A gate that is open from the start.
    pub(crate) fn ready(keys: KeyPair) -> Self {
        let (_tx, rx) = watch::channel(KeyState::Ready(Arc::new(keys)));
        Self { rx }
    }

    /// Waits for generation to finish.
    ///
    /// # Errors
    /// [`ChatError::KeysUnavailable`] if generation failed.
    pub(crate) async fn wait(&self) -> Result<Arc<KeyPair>, ChatError> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|state| !matches!(state, KeyState::Pending))
            .await
            .map(|state| state.clone());
        match state {
            Ok(KeyState::Ready(keys)) => Ok(keys),
            _ => Err(ChatError::KeysUnavailable),
        }
    }
}

/// Supplies the local key pair to a chat session created with
/// [`SecureChat::with_deferred_keys`](crate::SecureChat::with_deferred_keys),
/// for keys that are loaded or unlocked after startup.
///
/// Everything that needs the keys waits until [`provide`](Self::provide)
/// is called. Dropping the provider without providing disables chat: the
/// waiters fail with [`ChatError::KeysUnavailable`].
pub struct KeyProvider {
    tx: watch::Sender<KeyState>,
}

impl KeyProvider {
    /// Opens the gate with `keys`.
    pub fn provide(self, keys: KeyPair) {
        self.tx.send_replace(KeyState::Ready(Arc::new(keys)));
    }
}

impl Drop for KeyProvider {
    fn drop(&mut self) {
        if matches!(*self.tx.borrow(), KeyState::Pending) {
            self.tx.send_replace(KeyState::Failed);
        }
    }
}

/// Remote public keys by peer id.
///
/// Fan-out encryption reads a snapshot per call, so a peer removed
/// mid-send is simply missing from the next one.
#[derive(Default)]
pub(crate) struct KeyRegistry {
    keys: Mutex<HashMap<PeerId, Arc<PublicKey>>>,
}

impl KeyRegistry {
    pub(crate) async fn contains(&self, peer_id: &PeerId) -> bool {
        self.keys.lock().await.contains_key(peer_id)
    }

    /// Stores `key` unless the peer already has one. Returns whether it
    /// was stored.
    pub(crate) async fn insert_if_absent(&self, peer_id: PeerId, key: PublicKey) -> bool {
        let mut keys = self.keys.lock().await;
        if keys.contains_key(&peer_id) {
            return false;
        }
        keys.insert(peer_id, Arc::new(key));
        true
    }

    pub(crate) async fn remove(&self, peer_id: &PeerId) -> bool {
        self.keys.lock().await.remove(peer_id).is_some()
    }

    pub(crate) async fn snapshot(&self) -> Vec<(PeerId, Arc<PublicKey>)> {
        self.keys
            .lock()
            .await
            .iter()
            .map(|(id, key)| (id.clone(), Arc::clone(key)))
            .collect()
    }

    pub(crate) async fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.keys.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_crypto::MIN_KEY_BITS;

    fn small_keys() -> KeyPair {
        KeyPair::generate_with_bits(MIN_KEY_BITS).unwrap()
    }

    #[tokio::test]
    async fn test_ready_gate_returns_keys_immediately() {
        let keys = small_keys();
        let public = keys.public_key().clone();
        let gate = LocalKeys::ready(keys);

        let got = gate.wait().await.unwrap();
        assert_eq!(got.public_key(), &public);
    }

    #[tokio::test]
    async fn test_generate_gate_opens_once_keys_exist() {
        let gate = LocalKeys::generate(MIN_KEY_BITS);

        let keys = gate.wait().await.unwrap();
        assert_eq!(keys.public_key().bits(), MIN_KEY_BITS);
        // A second waiter sees the same pair.
        let again = gate.wait().await.unwrap();
        assert!(Arc::ptr_eq(&keys, &again));
    }

    #[tokio::test]
    async fn test_generate_too_small_key_closes_gate_with_error() {
        let gate = LocalKeys::generate(16);

        assert!(matches!(gate.wait().await, Err(ChatError::KeysUnavailable)));
    }

    #[tokio::test]
    async fn test_deferred_gate_waits_for_provider() {
        let (gate, provider) = LocalKeys::deferred();
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let keys = small_keys();
        let public = keys.public_key().clone();
        provider.provide(keys);

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.public_key(), &public);
    }

    #[tokio::test]
    async fn test_deferred_gate_provider_dropped_fails() {
        let (gate, provider) = LocalKeys::deferred();

        drop(provider);

        assert!(matches!(gate.wait().await, Err(ChatError::KeysUnavailable)));
    }

    #[tokio::test]
    async fn test_registry_insert_if_absent_keeps_first_key() {
        let registry = KeyRegistry::default();
        let first = small_keys().public_key().clone();
        let second = small_keys().public_key().clone();
        let bob = PeerId::from("bob");

        assert!(registry.insert_if_absent(bob.clone(), first.clone()).await);
        assert!(!registry.insert_if_absent(bob.clone(), second).await);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(*snapshot[0].1, first);
    }

    #[tokio::test]
    async fn test_registry_remove() {
        let registry = KeyRegistry::default();
        let bob = PeerId::from("bob");
        registry
            .insert_if_absent(bob.clone(), small_keys().public_key().clone())
            .await;

        assert!(registry.remove(&bob).await);
        assert!(!registry.remove(&bob).await);
        assert!(!registry.contains(&bob).await);
        assert!(registry.peer_ids().await.is_empty());
    }
}
