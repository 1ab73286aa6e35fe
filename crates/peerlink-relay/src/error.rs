//! Error types for the relay layer.

use peerlink_session::SessionError;

/// Errors that can occur during relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// `position_rate_hz` is 0, so there is nothing to schedule.
    #[error("position ticker is disabled (rate is 0 Hz)")]
    TickerDisabled,

    #[error(transparent)]
    Session(#[from] SessionError),
}
