//! Best-effort game-state relay for peerlink.
//!
//! # Key types
//!
//! - [`GameRelay`]: world-action and player-position broadcast, the
//!   periodic position ticker, and the game event feed
//! - [`GameEvent`]: a game payload received from a peer
//! - [`RelayConfig`]: ticker rate, start jitter, event buffer

mod config;
mod error;
mod events;
mod relay;

pub use config::RelayConfig;
pub use error::RelayError;
pub use events::GameEvent;
pub use relay::GameRelay;
