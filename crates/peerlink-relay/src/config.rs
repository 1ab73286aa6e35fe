//! Relay configuration.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Configuration for a [`GameRelay`](crate::GameRelay).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How often the position ticker broadcasts, in Hz. 0 disables the
    /// ticker. Default: 10.
    pub position_rate_hz: u32,

    /// Random delay (0–max ms) before the ticker's first broadcast, so
    /// peers started together do not tick in lockstep. Default: 50.
    pub initial_jitter_ms: u64,

    /// Buffer size of the game event feed. Default: 256.
    pub event_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            position_rate_hz: 10,
            initial_jitter_ms: 50,
            event_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Fastest supported position rate.
    pub const MAX_POSITION_RATE_HZ: u32 = 60;

    /// Clamps out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if self.position_rate_hz > Self::MAX_POSITION_RATE_HZ {
            warn!(
                rate = self.position_rate_hz,
                max = Self::MAX_POSITION_RATE_HZ,
                "position_rate_hz exceeds maximum, clamping"
            );
            self.position_rate_hz = Self::MAX_POSITION_RATE_HZ;
        }
        self.event_capacity = self.event_capacity.max(1);
        self
    }

    /// Time between position broadcasts, or `None` when the ticker is
    /// disabled.
    pub fn position_interval(&self) -> Option<Duration> {
        (self.position_rate_hz > 0)
            .then(|| Duration::from_secs_f64(1.0 / f64::from(self.position_rate_hz)))
    }
}
