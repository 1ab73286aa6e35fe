//! Chat configuration.

use peerlink_crypto::{DEFAULT_KEY_BITS, MIN_KEY_BITS};
use serde::Deserialize;

/// Configuration for a [`SecureChat`](crate::SecureChat) session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Buffer size of the chat event feed. Default: 256.
    pub event_capacity: usize,

    /// RSA modulus size of the local key pair. Default: 2048.
    pub key_bits: usize,

    /// Most entries kept in the local message log. Default: 100.
    pub history_limit: usize,

    /// How many of the oldest entries are dropped at once when the log
    /// overflows. Default: 20.
    pub history_trim: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            key_bits: DEFAULT_KEY_BITS,
            history_limit: 100,
            history_trim: 20,
        }
    }
}

impl ChatConfig {
    /// Clamps out-of-range values so the config is safe to use.
    ///
    /// - `key_bits` raised to at least [`MIN_KEY_BITS`].
    /// - `event_capacity` at least 1.
    /// - `history_trim` kept within `1..=history_limit` (when the limit is
    ///   non-zero).
    pub fn validated(mut self) -> Self {
        if self.key_bits < MIN_KEY_BITS {
            tracing::warn!(
                key_bits = self.key_bits,
                min = MIN_KEY_BITS,
                "key_bits below minimum, raising"
            );
            self.key_bits = MIN_KEY_BITS;
        }
        self.event_capacity = self.event_capacity.max(1);
        self.history_trim = self.history_trim.clamp(1, self.history_limit.max(1));
        self
    }
}
