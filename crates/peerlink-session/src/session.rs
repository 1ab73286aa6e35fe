//! Session types: configuration and the per-peer readiness state machine.
//!
//! Everything here is synchronous and transport-agnostic so each
//! transition can be tested on its own; the manager feeds it
//! [`ConnectionEvent`]s and acts on the returned [`Transition`].

use std::time::Duration;

use peerlink_transport::{ChannelConfig, ChannelKind, ConnectionEvent, Direction};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for the peer session manager.
///
/// Deserializable so it can live in a config file; missing fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a connection may take to open both channels before it is
    /// abandoned. `0` disables the bound.
    ///
    /// Default: 30 seconds.
    pub connect_timeout_secs: u64,

    /// Retransmit budget of the guaranteed channel. Default: 10.
    pub guaranteed_max_retransmits: u16,

    /// Buffer size of the event feed. A subscriber that falls further
    /// behind than this misses events (and is told so). Default: 256.
    pub event_capacity: usize,

    /// Prefix for generated peer ids. Default: `"player"`.
    pub id_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            guaranteed_max_retransmits: 10,
            event_capacity: 256,
            id_prefix: "player".to_string(),
        }
    }
}

impl SessionConfig {
    /// The connect timeout, or `None` when disabled.
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }

    /// Negotiation parameters for the guaranteed channel.
    pub fn guaranteed_channel(&self) -> ChannelConfig {
        ChannelConfig::guaranteed(self.guaranteed_max_retransmits)
    }
}

// ---------------------------------------------------------------------------
// PeerState / PeerLifecycle
// ---------------------------------------------------------------------------

/// Where a peer connection is in its life.
///
/// ```text
///   Connecting ──(one channel open)──→ AwaitingChannels ──(both open)──→ Ready
///       │                                   │                              │
///       └──────(channel closed/error, terminal ICE state, timeout)─────────┴──→ Closed
/// ```
///
/// Only `Ready` peers are visible to senders. `Closed` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    AwaitingChannels,
    Ready,
    Closed,
}

/// What a state change means for the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing observable changed.
    Unchanged,
    /// The peer just became ready: announce it.
    Ready,
    /// The peer just closed. `was_ready` says whether it had been
    /// announced and therefore needs a matching departure.
    Closed { was_ready: bool },
}

/// The readiness state machine for one connection.
#[derive(Debug, Clone)]
pub struct PeerLifecycle {
    state: PeerState,
    default_open: bool,
    guaranteed_open: bool,
    reached_ready: bool,
}

impl Default for PeerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerLifecycle {
    pub fn new() -> Self {
        Self {
            state: PeerState::Connecting,
            default_open: false,
            guaranteed_open: false,
            reached_ready: false,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Whether this connection was ever announced.
    pub fn reached_ready(&self) -> bool {
        self.reached_ready
    }

    /// Feeds one transport event through the machine.
    ///
    /// Data messages never change state.
    pub fn on_event(&mut self, event: &ConnectionEvent) -> Transition {
        match event {
            ConnectionEvent::ChannelOpen(channel) => self.channel_opened(*channel),
            ConnectionEvent::ChannelClosed(_) | ConnectionEvent::ChannelError(..) => self.close(),
            ConnectionEvent::IceStateChanged(ice) if ice.is_terminal() => self.close(),
            ConnectionEvent::IceStateChanged(_) | ConnectionEvent::Message { .. } => {
                Transition::Unchanged
            }
        }
    }

    /// Marks `channel` open. Re-opening an open channel is a no-op.
    pub fn channel_opened(&mut self, channel: ChannelKind) -> Transition {
        if self.state == PeerState::Closed {
            return Transition::Unchanged;
        }
        match channel {
            ChannelKind::Default => self.default_open = true,
            ChannelKind::Guaranteed => self.guaranteed_open = true,
        }
        match (self.state, self.default_open && self.guaranteed_open) {
            (PeerState::Ready, _) => Transition::Unchanged,
            (_, true) => {
                self.state = PeerState::Ready;
                self.reached_ready = true;
                Transition::Ready
            }
            (_, false) => {
                self.state = PeerState::AwaitingChannels;
                Transition::Unchanged
            }
        }
    }

    /// Moves to `Closed`. Only the first call reports a transition.
    pub fn close(&mut self) -> Transition {
        if self.state == PeerState::Closed {
            return Transition::Unchanged;
        }
        self.state = PeerState::Closed;
        self.default_open = false;
        self.guaranteed_open = false;
        Transition::Closed {
            was_ready: self.reached_ready,
        }
    }
}

// ---------------------------------------------------------------------------
// Admission of duplicate connections
// ---------------------------------------------------------------------------

/// The peer id that dialed a connection.
pub fn initiator<'a>(local_id: &'a str, remote_id: &'a str, direction: Direction) -> &'a str {
    match direction {
        Direction::Outbound => local_id,
        Direction::Inbound => remote_id,
    }
}

/// What to do with a new connection for a peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No competing connection; register it.
    Accept,
    /// Close the registered connection and register the new one.
    Replace,
    /// Close the new connection and keep the registered one.
    Reject,
}

/// Decides between a registered connection and a new one for the same
/// peer, given who dialed each.
///
/// When two peers dial each other at once, both sides must keep the same
/// link. Both sides see the same pair of initiators, so preferring the
/// link dialed by the smaller id converges without coordination. When the
/// same side dialed both, the remote is re-dialing after losing its end, so
/// an inbound newcomer wins; a second outbound dial of our own loses.
pub fn admit(
    registered: Option<(PeerState, &str)>,
    incoming_initiator: &str,
    incoming_direction: Direction,
) -> Admission {
    let Some((state, registered_initiator)) = registered else {
        return Admission::Accept;
    };
    if state == PeerState::Closed {
        return Admission::Replace;
    }
    if registered_initiator == incoming_initiator {
        return match incoming_direction {
            Direction::Inbound => Admission::Replace,
            Direction::Outbound => Admission::Reject,
        };
    }
    if incoming_initiator < registered_initiator {
        Admission::Replace
    } else {
        Admission::Reject
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the readiness machine and admission rule.
    //!
    //! Naming: `test_{function}_{scenario}_{expected}`.

    use peerlink_transport::IceConnectionState;

    use super::*;

    fn open(channel: ChannelKind) -> ConnectionEvent {
        ConnectionEvent::ChannelOpen(channel)
    }

    // =====================================================================
    // PeerLifecycle
    // =====================================================================

    #[test]
    fn test_lifecycle_new_is_connecting() {
        let lc = PeerLifecycle::new();
        assert_eq!(lc.state(), PeerState::Connecting);
        assert!(!lc.reached_ready());
    }

    #[test]
    fn test_lifecycle_default_then_guaranteed_ready_once() {
        let mut lc = PeerLifecycle::new();

        assert_eq!(lc.on_event(&open(ChannelKind::Default)), Transition::Unchanged);
        assert_eq!(lc.state(), PeerState::AwaitingChannels);
        assert_eq!(lc.on_event(&open(ChannelKind::Guaranteed)), Transition::Ready);
        assert_eq!(lc.state(), PeerState::Ready);
    }

    #[test]
    fn test_lifecycle_guaranteed_then_default_ready_once() {
        let mut lc = PeerLifecycle::new();

        assert_eq!(lc.on_event(&open(ChannelKind::Guaranteed)), Transition::Unchanged);
        assert_eq!(lc.state(), PeerState::AwaitingChannels);
        assert_eq!(lc.on_event(&open(ChannelKind::Default)), Transition::Ready);
    }

    #[test]
    fn test_lifecycle_duplicate_open_does_not_ready_twice() {
        let mut lc = PeerLifecycle::new();
        lc.on_event(&open(ChannelKind::Default));
        lc.on_event(&open(ChannelKind::Guaranteed));

        assert_eq!(lc.on_event(&open(ChannelKind::Default)), Transition::Unchanged);
        assert_eq!(lc.on_event(&open(ChannelKind::Guaranteed)), Transition::Unchanged);
    }

    #[test]
    fn test_lifecycle_same_channel_twice_stays_awaiting() {
        let mut lc = PeerLifecycle::new();
        lc.on_event(&open(ChannelKind::Default));
        lc.on_event(&open(ChannelKind::Default));

        assert_eq!(lc.state(), PeerState::AwaitingChannels);
    }

    #[test]
    fn test_lifecycle_close_before_ready_reports_not_ready() {
        let mut lc = PeerLifecycle::new();
        lc.on_event(&open(ChannelKind::Default));

        let t = lc.on_event(&ConnectionEvent::ChannelClosed(ChannelKind::Default));

        assert_eq!(t, Transition::Closed { was_ready: false });
        assert_eq!(lc.state(), PeerState::Closed);
    }

    #[test]
    fn test_lifecycle_close_after_ready_reports_ready() {
        let mut lc = PeerLifecycle::new();
        lc.on_event(&open(ChannelKind::Default));
        lc.on_event(&open(ChannelKind::Guaranteed));

        let t = lc.on_event(&ConnectionEvent::ChannelError(
            ChannelKind::Guaranteed,
            "sctp abort".into(),
        ));

        assert_eq!(t, Transition::Closed { was_ready: true });
    }

    #[test]
    fn test_lifecycle_close_is_reported_once() {
        let mut lc = PeerLifecycle::new();
        lc.on_event(&open(ChannelKind::Default));
        lc.on_event(&open(ChannelKind::Guaranteed));

        assert!(matches!(lc.close(), Transition::Closed { .. }));
        assert_eq!(lc.close(), Transition::Unchanged);
        assert_eq!(
            lc.on_event(&ConnectionEvent::ChannelClosed(ChannelKind::Default)),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_lifecycle_closed_ignores_late_open() {
        let mut lc = PeerLifecycle::new();
        lc.close();

        assert_eq!(lc.on_event(&open(ChannelKind::Default)), Transition::Unchanged);
        assert_eq!(lc.on_event(&open(ChannelKind::Guaranteed)), Transition::Unchanged);
        assert_eq!(lc.state(), PeerState::Closed);
    }

    #[test]
    fn test_lifecycle_terminal_ice_states_close() {
        for ice in [
            IceConnectionState::Disconnected,
            IceConnectionState::Failed,
            IceConnectionState::Closed,
        ] {
            let mut lc = PeerLifecycle::new();
            let t = lc.on_event(&ConnectionEvent::IceStateChanged(ice));
            assert_eq!(t, Transition::Closed { was_ready: false }, "{ice}");
        }
    }

    #[test]
    fn test_lifecycle_non_terminal_ice_and_data_unchanged() {
        let mut lc = PeerLifecycle::new();

        for event in [
            ConnectionEvent::IceStateChanged(IceConnectionState::Checking),
            ConnectionEvent::IceStateChanged(IceConnectionState::Connected),
            ConnectionEvent::Message {
                channel: ChannelKind::Default,
                data: b"{}".to_vec(),
            },
        ] {
            assert_eq!(lc.on_event(&event), Transition::Unchanged);
        }
        assert_eq!(lc.state(), PeerState::Connecting);
    }

    // =====================================================================
    // admit()
    // =====================================================================

    #[test]
    fn test_admit_no_registered_accepts() {
        assert_eq!(admit(None, "bob", Direction::Inbound), Admission::Accept);
    }

    #[test]
    fn test_admit_crossing_dials_smaller_initiator_wins() {
        // alice's view: her own dial is registered, bob's arrives.
        let at_alice = admit(
            Some((PeerState::AwaitingChannels, "alice")),
            "bob",
            Direction::Inbound,
        );
        // bob's view: his own dial is registered, alice's arrives.
        let at_bob = admit(
            Some((PeerState::AwaitingChannels, "bob")),
            "alice",
            Direction::Inbound,
        );

        assert_eq!(at_alice, Admission::Reject);
        assert_eq!(at_bob, Admission::Replace);
    }

    #[test]
    fn test_admit_crossing_dials_applies_even_when_ready() {
        let decision = admit(Some((PeerState::Ready, "bob")), "alice", Direction::Inbound);
        assert_eq!(decision, Admission::Replace);
    }

    #[test]
    fn test_admit_remote_redial_replaces() {
        let decision = admit(Some((PeerState::Ready, "bob")), "bob", Direction::Inbound);
        assert_eq!(decision, Admission::Replace);
    }

    #[test]
    fn test_admit_second_own_dial_rejected() {
        let decision = admit(
            Some((PeerState::Connecting, "alice")),
            "alice",
            Direction::Outbound,
        );
        assert_eq!(decision, Admission::Reject);
    }

    #[test]
    fn test_initiator_follows_direction() {
        assert_eq!(initiator("me", "you", Direction::Outbound), "me");
        assert_eq!(initiator("me", "you", Direction::Inbound), "you");
    }

    // =====================================================================
    // SessionConfig
    // =====================================================================

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.guaranteed_channel().max_retransmits, Some(10));
        assert!(config.guaranteed_channel().ordered);
    }

    #[test]
    fn test_config_zero_timeout_disables() {
        let config = SessionConfig {
            connect_timeout_secs: 0,
            ..SessionConfig::default()
        };
        assert_eq!(config.connect_timeout(), None);
    }

    #[test]
    fn test_config_partial_json_fills_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"connect_timeout_secs": 5}"#).unwrap();
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.guaranteed_max_retransmits, 10);
        assert_eq!(config.id_prefix, "player");
    }
}
