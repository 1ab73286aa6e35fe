//! # peerlink
//!
//! Peer-to-peer sessions with end-to-end encrypted chat and a best-effort
//! game-state relay.
//!
//! Each [`Node`] is one local peer. It owns a session manager (connection
//! lifecycle, readiness, delivery), a secure chat session (RSA-OAEP key
//! exchange, per-recipient encryption), and a game relay (world actions,
//! player positions), wired together by an inbound dispatcher.
//!
//! ## Transports
//!
//! Any [`PeerTransport`](peerlink_transport::PeerTransport) can carry a
//! node. [`NodeBuilder::build_in_memory`] wires nodes inside one process;
//! with the `webrtc` feature, `NodeBuilder::build_webrtc` reaches other
//! processes and browsers over WebRTC data channels, given a
//! [`Signaler`](peerlink_transport::Signaler) for the offer/answer
//! exchange.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerlink::prelude::*;
//!
//! # async fn run() -> Result<(), PeerlinkError> {
//! let network = MemoryNetwork::new();
//! let alice = Node::builder().peer_id("alice").build_in_memory(&network)?;
//! let bob = Node::builder().peer_id("bob").build_in_memory(&network)?;
//!
//! alice.connect_to_peer(bob.local_id()).await?;
//! // ...wait for PeerEvent::Added and ChatEvent::PeerJoined, then:
//! alice.send_chat_message("hi").await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatch;
mod error;
mod node;

pub use config::NodeConfig;
pub use error::PeerlinkError;
pub use node::{Node, NodeBuilder};

/// Installs a `tracing` subscriber that honors `RUST_LOG` (default
/// `info`). Safe to call more than once; later calls do nothing.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

pub mod prelude {
    pub use crate::{Node, NodeBuilder, NodeConfig, PeerlinkError, init_tracing};
    pub use peerlink_chat::{ChatConfig, ChatError, ChatEvent};
    pub use peerlink_crypto::KeyPair;
    pub use peerlink_protocol::{
        GamePayload, Gravitation, PeerId, RadialExplosion, Updraft, Vector3, Vortex, WorldAction,
    };
    pub use peerlink_relay::{GameEvent, RelayConfig};
    pub use peerlink_session::{Delivery, PeerEvent, PeerEvents, SessionConfig};
    pub use peerlink_transport::{MemoryNetwork, MemoryTransport};
    #[cfg(feature = "webrtc")]
    pub use peerlink_transport::{SignalHub, Signaler, WebRtcConfig, WebRtcTransport};
}
