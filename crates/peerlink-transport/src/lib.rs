//! Transport boundary for peerlink.
//!
//! Provides the [`PeerTransport`] and [`PeerConnection`] traits that
//! abstract over a NAT-traversed, dual-channel peer link (a WebRTC peer
//! connection with two data channels, in a browser deployment).
//!
//! Every connection carries two channels:
//!
//! - the **default** channel: unordered, no retransmits. Used for
//!   high-frequency game state where staleness beats head-of-line blocking.
//! - the **guaranteed** channel: ordered, retransmitted up to a bounded
//!   count. Used for handshakes and chat.
//!
//! Transport callbacks (channel open/close, ICE state changes, inbound
//! data) are surfaced as a single ordered stream of [`ConnectionEvent`]s
//! per connection.
//!
//! # Feature Flags
//!
//! - `memory` (default): in-process transport via [`MemoryNetwork`]
//! - `webrtc`: WebRTC data channels via the `webrtc` crate
//!   ([`WebRtcTransport`]), with signaling behind the [`Signaler`] trait

mod error;
#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "webrtc")]
mod rtc;

pub use error::TransportError;
#[cfg(feature = "memory")]
pub use memory::{MemoryConnection, MemoryNetwork, MemoryTransport, OpenOrder};
#[cfg(feature = "webrtc")]
pub use rtc::{
    DEFAULT_CHANNEL_LABEL, HubSignaler, Signal, SignalBody, SignalHub, Signaler, WebRtcConfig,
    WebRtcConnection, WebRtcTransport,
};

use std::fmt;
use std::future::Future;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side dialed the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We called `connect`.
    Outbound,
    /// The remote dialed us and we got it from `accept`.
    Inbound,
}

/// One of the two data channels of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Unordered, best-effort. Created implicitly on connect.
    Default,
    /// Ordered, bounded retransmits. Negotiated explicitly.
    Guaranteed,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Guaranteed => write!(f, "guaranteed"),
        }
    }
}

/// Negotiation parameters for a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Channel label announced to the remote side.
    pub label: String,
    /// Whether delivery order is preserved.
    pub ordered: bool,
    /// Retransmit budget per message. `None` means unlimited.
    pub max_retransmits: Option<u16>,
}

impl ChannelConfig {
    /// The default channel: unordered, fire-and-forget.
    pub fn best_effort() -> Self {
        Self {
            label: "default".to_string(),
            ordered: false,
            max_retransmits: Some(0),
        }
    }

    /// The guaranteed channel: ordered, retransmitted up to
    /// `max_retransmits` times before the message is dropped.
    pub fn guaranteed(max_retransmits: u16) -> Self {
        Self {
            label: "guaranteed".to_string(),
            ordered: true,
            max_retransmits: Some(max_retransmits),
        }
    }
}

/// ICE connection state as reported by the underlying stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Returns `true` for states after which the connection is unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A channel finished negotiation and can carry data.
    ChannelOpen(ChannelKind),
    /// A channel was closed by either side.
    ChannelClosed(ChannelKind),
    /// A channel reported an error. The channel is unusable afterwards.
    ChannelError(ChannelKind, String),
    /// The ICE agent changed state.
    IceStateChanged(IceConnectionState),
    /// Data arrived on a channel.
    Message { channel: ChannelKind, data: Vec<u8> },
}

/// Dials and accepts peer connections.
///
/// Methods return `impl Future + Send` (rather than `async fn`) so that
/// generic callers can drive them from spawned Tokio tasks.
pub trait PeerTransport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: PeerConnection;

    /// The identity this endpoint is reachable under.
    fn local_id(&self) -> &str;

    /// Starts an outbound connection to `remote_id`.
    ///
    /// Returning `Ok` only means the attempt started; channel readiness is
    /// reported later through [`PeerConnection::next_event`].
    fn connect(
        &self,
        remote_id: &str,
        guaranteed: &ChannelConfig,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    /// Waits for the next inbound connection.
    ///
    /// Returns `None` once the transport can no longer accept connections.
    fn accept(&self) -> impl Future<Output = Option<Self::Connection>> + Send;
}

/// A single peer connection carrying a default and a guaranteed channel.
pub trait PeerConnection: Send + Sync + 'static {
    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// The remote peer's identity.
    fn remote_id(&self) -> &str;

    /// Which side dialed.
    fn direction(&self) -> Direction;

    /// Whether `channel` is currently open for sending.
    fn is_open(&self, channel: ChannelKind) -> bool;

    /// Sends data on the given channel.
    fn send(
        &self,
        channel: ChannelKind,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next transport event.
    ///
    /// Returns `None` when the connection is gone for good.
    fn next_event(&self) -> impl Future<Output = Option<ConnectionEvent>> + Send;

    /// Closes both channels and the connection. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
