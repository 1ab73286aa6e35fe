//! In-process transport built from Tokio channels.
//!
//! A [`MemoryNetwork`] plays the part of the signaling server and the ICE
//! stack at once: endpoints register under a peer id, `connect` links two
//! endpoints directly, and the network replays the event sequence a real
//! peer connection would produce (ICE checking → connected, then the two
//! channels opening). [`OpenOrder`] controls that sequence so callers can
//! exercise partially-open and stalled connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::{
    ChannelConfig, ChannelKind, ConnectionEvent, ConnectionId, Direction,
    IceConnectionState, PeerConnection, PeerTransport, TransportError,
};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Counter for telling endpoint registrations apart.
static NEXT_ENDPOINT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The order in which channels report open after a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenOrder {
    /// Default channel first, then guaranteed.
    #[default]
    DefaultFirst,
    /// Guaranteed channel first, then default.
    GuaranteedFirst,
    /// Only the default channel ever opens.
    DefaultOnly,
    /// ICE starts checking and never gets further.
    Never,
}

// ---------------------------------------------------------------------------
// Link: the shared state between the two ends of a connection
// ---------------------------------------------------------------------------

struct Side {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    default_open: AtomicBool,
    guaranteed_open: AtomicBool,
}

impl Side {
    fn new(events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            events,
            default_open: AtomicBool::new(false),
            guaranteed_open: AtomicBool::new(false),
        }
    }

    fn flag(&self, channel: ChannelKind) -> &AtomicBool {
        match channel {
            ChannelKind::Default => &self.default_open,
            ChannelKind::Guaranteed => &self.guaranteed_open,
        }
    }

    fn is_open(&self, channel: ChannelKind) -> bool {
        self.flag(channel).load(Ordering::Acquire)
    }

    fn push(&self, event: ConnectionEvent) {
        // The receiving connection may already be gone.
        let _ = self.events.send(event);
    }

    fn open(&self, channel: ChannelKind) {
        self.flag(channel).store(true, Ordering::Release);
        self.push(ConnectionEvent::ChannelOpen(channel));
    }

    fn shut(&self, channel: ChannelKind) {
        if self.flag(channel).swap(false, Ordering::AcqRel) {
            self.push(ConnectionEvent::ChannelClosed(channel));
        }
    }
}

struct Link {
    /// Peer ids of side 0 (dialer) and side 1 (listener).
    ids: [String; 2],
    sides: [Side; 2],
    closed: AtomicBool,
}

impl Link {
    fn connects(&self, a: &str, b: &str) -> bool {
        (self.ids[0] == a && self.ids[1] == b)
            || (self.ids[0] == b && self.ids[1] == a)
    }

    fn both(&self, event: ConnectionEvent) {
        for side in &self.sides {
            side.push(event.clone());
        }
    }

    fn negotiate(&self, order: OpenOrder) {
        self.both(ConnectionEvent::IceStateChanged(IceConnectionState::Checking));
        let channels: &[ChannelKind] = match order {
            OpenOrder::DefaultFirst => &[ChannelKind::Default, ChannelKind::Guaranteed],
            OpenOrder::GuaranteedFirst => &[ChannelKind::Guaranteed, ChannelKind::Default],
            OpenOrder::DefaultOnly => &[ChannelKind::Default],
            OpenOrder::Never => return,
        };
        self.both(ConnectionEvent::IceStateChanged(IceConnectionState::Connected));
        for &channel in channels {
            for side in &self.sides {
                side.open(channel);
            }
        }
    }

    /// Closes both channels on both sides and reports `ice` to each.
    /// Returns `false` if the link was already torn down.
    fn teardown(&self, ice: IceConnectionState) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for side in &self.sides {
            side.shut(ChannelKind::Default);
            side.shut(ChannelKind::Guaranteed);
            side.push(ConnectionEvent::IceStateChanged(ice));
        }
        true
    }
}

// ---------------------------------------------------------------------------
// MemoryNetwork
// ---------------------------------------------------------------------------

type Incoming = mpsc::UnboundedSender<MemoryConnection>;

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<String, (u64, Incoming)>>,
    links: Mutex<Vec<Weak<Link>>>,
    open_order: OpenOrder,
}

/// A shared in-process "internet" that endpoints register with.
///
/// Cheap to clone; clones refer to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Creates a network where channels open default-first.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a network that opens channels in the given order.
    pub fn with_open_order(open_order: OpenOrder) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                open_order,
                ..NetworkInner::default()
            }),
        }
    }

    /// Registers an endpoint reachable under `local_id`.
    ///
    /// # Errors
    /// Returns [`TransportError::AddressInUse`] if the id is taken.
    pub fn endpoint(
        &self,
        local_id: impl Into<String>,
    ) -> Result<MemoryTransport, TransportError> {
        let local_id = local_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = NEXT_ENDPOINT_TOKEN.fetch_add(1, Ordering::Relaxed);

        let mut endpoints = lock(&self.inner.endpoints);
        if endpoints.contains_key(&local_id) {
            return Err(TransportError::AddressInUse(local_id));
        }
        endpoints.insert(local_id.clone(), (token, tx));
        drop(endpoints);

        tracing::debug!(%local_id, "memory endpoint registered");
        Ok(MemoryTransport {
            local_id,
            token,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    /// Simulates the network path between `a` and `b` dropping.
    ///
    /// Every live connection between the two is closed on both sides and
    /// reports ICE `disconnected`. Returns how many connections were cut.
    pub fn sever(&self, a: &str, b: &str) -> usize {
        let mut links = lock(&self.inner.links);
        links.retain(|weak| weak.strong_count() > 0);
        let mut cut = 0;
        for link in links.iter().filter_map(Weak::upgrade) {
            if link.connects(a, b)
                && link.teardown(IceConnectionState::Disconnected)
            {
                cut += 1;
            }
        }
        tracing::debug!(a, b, cut, "severed memory links");
        cut
    }

    fn listener(&self, remote_id: &str) -> Option<Incoming> {
        lock(&self.inner.endpoints)
            .get(remote_id)
            .map(|(_, tx)| tx.clone())
    }

    fn track(&self, link: &Arc<Link>) {
        lock(&self.inner.links).push(Arc::downgrade(link));
    }

    fn unregister(&self, local_id: &str, token: u64) {
        let mut endpoints = lock(&self.inner.endpoints);
        if endpoints.get(local_id).is_some_and(|(t, _)| *t == token) {
            endpoints.remove(local_id);
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

/// One endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    local_id: String,
    token: u64,
    network: MemoryNetwork,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
}

impl PeerTransport for MemoryTransport {
    type Connection = MemoryConnection;

    fn local_id(&self) -> &str {
        &self.local_id
    }

    async fn connect(
        &self,
        remote_id: &str,
        guaranteed: &ChannelConfig,
    ) -> Result<MemoryConnection, TransportError> {
        let listener = self
            .network
            .listener(remote_id)
            .ok_or_else(|| TransportError::PeerUnavailable(remote_id.to_string()))?;

        let (dialer_tx, dialer_rx) = mpsc::unbounded_channel();
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            ids: [self.local_id.clone(), remote_id.to_string()],
            sides: [Side::new(dialer_tx), Side::new(listener_tx)],
            closed: AtomicBool::new(false),
        });

        let outbound = MemoryConnection::new(
            Arc::clone(&link),
            0,
            remote_id.to_string(),
            Direction::Outbound,
            dialer_rx,
        );
        let inbound = MemoryConnection::new(
            Arc::clone(&link),
            1,
            self.local_id.clone(),
            Direction::Inbound,
            listener_rx,
        );

        listener
            .send(inbound)
            .map_err(|_| TransportError::PeerUnavailable(remote_id.to_string()))?;
        self.network.track(&link);

        tracing::debug!(
            local_id = %self.local_id,
            %remote_id,
            conn_id = %outbound.id,
            label = %guaranteed.label,
            max_retransmits = ?guaranteed.max_retransmits,
            "memory connection dialed"
        );
        link.negotiate(self.network.inner.open_order);
        Ok(outbound)
    }

    async fn accept(&self) -> Option<MemoryConnection> {
        self.incoming.lock().await.recv().await
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unregister(&self.local_id, self.token);
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

/// One end of an in-memory peer connection.
pub struct MemoryConnection {
    id: ConnectionId,
    remote_id: String,
    direction: Direction,
    side: usize,
    link: Arc<Link>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl MemoryConnection {
    fn new(
        link: Arc<Link>,
        side: usize,
        remote_id: String,
        direction: Direction,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self {
            id: ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            remote_id,
            direction,
            side,
            link,
            events: tokio::sync::Mutex::new(events),
        }
    }

    fn local(&self) -> &Side {
        &self.link.sides[self.side]
    }

    fn remote(&self) -> &Side {
        &self.link.sides[1 - self.side]
    }
}

impl PeerConnection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn is_open(&self, channel: ChannelKind) -> bool {
        self.local().is_open(channel)
    }

    async fn send(
        &self,
        channel: ChannelKind,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if !self.local().is_open(channel) || !self.remote().is_open(channel) {
            return Err(TransportError::ChannelClosed(channel));
        }
        self.remote()
            .events
            .send(ConnectionEvent::Message {
                channel,
                data: data.to_vec(),
            })
            .map_err(|_| TransportError::SendFailed("remote end dropped".into()))
    }

    async fn next_event(&self) -> Option<ConnectionEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) {
        if self.link.teardown(IceConnectionState::Closed) {
            tracing::debug!(conn_id = %self.id, remote_id = %self.remote_id, "memory connection closed");
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.link.teardown(IceConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_order_default_is_default_first() {
        assert_eq!(OpenOrder::default(), OpenOrder::DefaultFirst);
    }

    #[test]
    fn test_endpoint_duplicate_id_rejected() {
        let network = MemoryNetwork::new();
        let _first = network.endpoint("alice").expect("should register");

        let result = network.endpoint("alice");

        assert!(matches!(result, Err(TransportError::AddressInUse(id)) if id == "alice"));
    }

    #[test]
    fn test_endpoint_id_reusable_after_drop() {
        let network = MemoryNetwork::new();
        let first = network.endpoint("alice").unwrap();
        drop(first);

        assert!(network.endpoint("alice").is_ok());
    }

    #[test]
    fn test_sever_without_links_cuts_nothing() {
        let network = MemoryNetwork::new();
        assert_eq!(network.sever("a", "b"), 0);
    }
}
