//! End-to-end encrypted chat for peerlink.
//!
//! # Key types
//!
//! - [`SecureChat`]: handshake, fan-out encryption, decryption, and the
//!   chat event feed
//! - [`ChatEvent`]: messages plus peer joined/left system events
//! - [`ChatConfig`]: key size, event buffer, message log bounds
//! - [`KeyProvider`]: supplies a key pair that is not available at startup
//!
//! Identity is trust-on-first-use: the first public key a peer id
//! presents is the one used for the rest of the session, with no
//! out-of-band verification. Whoever controls the signaling path can
//! impersonate a peer id that has not connected yet.

mod chat;
mod config;
mod error;
mod events;
mod keys;

pub use chat::SecureChat;
pub use config::ChatConfig;
pub use error::ChatError;
pub use events::ChatEvent;
pub use keys::KeyProvider;
