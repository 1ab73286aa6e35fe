//! Peer session management for peerlink.
//!
//! This crate owns the transport-level lifecycle of every peer connection:
//!
//! 1. **Identity**: generating this peer's id ([`generate_peer_id`])
//! 2. **Readiness**: a peer is exposed only once both of its channels are
//!    open ([`PeerLifecycle`], [`PeerState`])
//! 3. **Delivery**: send and broadcast over the default or guaranteed
//!    channel ([`PeerSessionManager`], [`Delivery`])
//! 4. **Events**: ordered peer add/remove and message feeds
//!    ([`SessionEvent`], [`PeerEvents`], [`Messages`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Chat / Relay (above)  ← react to peers, send payloads, consume messages
//!     ↕
//! Session Layer (this crate)  ← connections, readiness, envelopes
//!     ↕
//! Transport (below)  ← PeerTransport / PeerConnection
//! ```

mod driver;
mod error;
mod events;
mod identity;
mod manager;
mod session;

pub use error::SessionError;
pub use events::{Delivery, MessageEvent, Messages, PeerEvent, PeerEvents, SessionEvent};
pub use identity::generate_peer_id;
pub use manager::PeerSessionManager;
pub use session::{Admission, PeerLifecycle, PeerState, SessionConfig, Transition, admit, initiator};
