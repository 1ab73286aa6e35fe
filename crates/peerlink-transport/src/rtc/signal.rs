//! Signaling: how offers, answers and ICE candidates reach the other peer
//! before any data channel exists.
//!
//! The transport does not care what carries these messages (a WebSocket
//! relay, a broker such as PeerJS, a pub/sub topic). It only needs a
//! [`Signaler`] that can address a peer id and hand back whatever arrives
//! for us. [`SignalHub`] is an in-process implementation for tests and
//! single-process demos.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::TransportError;

/// One signaling message.
///
/// `session` names the negotiation the message belongs to. Two peers can
/// dial each other at the same moment, so the remote id alone does not say
/// which of the two pending connections an answer is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Peer id of the sender.
    pub from: String,
    pub session: String,
    #[serde(flatten)]
    pub body: SignalBody,
}

/// The payload of a [`Signal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalBody {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    /// A trickled ICE candidate.
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }
}

/// Carries [`Signal`]s between peers.
///
/// ## Trait bounds explained
///
/// - `Send + Sync + 'static`: the transport shares the signaler between
///   the caller of `connect` and a background task that pumps inbound
///   signals, so it must live in an `Arc` across tasks.
/// - `impl Future + Send` returns: that pump task is spawned on the Tokio
///   runtime, which needs every future it awaits to be `Send`.
///
/// `recv` has a single consumer (the transport's pump); implementations
/// may assume it is never polled concurrently with itself.
pub trait Signaler: Send + Sync + 'static {
    /// The id other peers reach us under.
    fn local_id(&self) -> &str;

    /// Delivers `signal` to peer `to`.
    ///
    /// # Errors
    /// [`TransportError::PeerUnavailable`] if `to` cannot be reached.
    fn send(
        &self,
        to: &str,
        signal: Signal,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next signal addressed to us. `None` once signaling
    /// is gone for good.
    fn recv(&self) -> impl Future<Output = Option<Signal>> + Send;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Mailboxes = HashMap<String, (u64, mpsc::UnboundedSender<Signal>)>;

/// An in-process signaling relay.
///
/// Cheap to clone; clones refer to the same hub.
#[derive(Clone, Default)]
pub struct SignalHub {
    mailboxes: Arc<Mutex<Mailboxes>>,
    next_token: Arc<std::sync::atomic::AtomicU64>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mailbox for `local_id`.
    ///
    /// # Errors
    /// [`TransportError::AddressInUse`] if the id is taken.
    pub fn join(&self, local_id: impl Into<String>) -> Result<HubSignaler, TransportError> {
        let local_id = local_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self
            .next_token
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut mailboxes = lock(&self.mailboxes);
        if mailboxes.contains_key(&local_id) {
            return Err(TransportError::AddressInUse(local_id));
        }
        mailboxes.insert(local_id.clone(), (token, tx));
        drop(mailboxes);

        Ok(HubSignaler {
            local_id,
            token,
            hub: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    fn deliver(&self, to: &str, signal: Signal) -> Result<(), TransportError> {
        let mailboxes = lock(&self.mailboxes);
        let (_, tx) = mailboxes
            .get(to)
            .ok_or_else(|| TransportError::PeerUnavailable(to.to_string()))?;
        tx.send(signal)
            .map_err(|_| TransportError::PeerUnavailable(to.to_string()))
    }

    fn leave(&self, local_id: &str, token: u64) {
        let mut mailboxes = lock(&self.mailboxes);
        if mailboxes.get(local_id).is_some_and(|(t, _)| *t == token) {
            mailboxes.remove(local_id);
        }
    }
}

/// One peer's mailbox on a [`SignalHub`]. Dropping it leaves the hub.
pub struct HubSignaler {
    local_id: String,
    token: u64,
    hub: SignalHub,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Signal>>,
}

impl Signaler for HubSignaler {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    async fn send(&self, to: &str, signal: Signal) -> Result<(), TransportError> {
        self.hub.deliver(to, signal)
    }

    async fn recv(&self) -> Option<Signal> {
        self.inbox.lock().await.recv().await
    }
}

impl Drop for HubSignaler {
    fn drop(&mut self) {
        self.hub.leave(&self.local_id, self.token);
    }
}
