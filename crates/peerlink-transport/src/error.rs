use crate::ChannelKind;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Nobody is listening under the requested peer id.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// Another endpoint is already registered under this id.
    #[error("address in use: {0}")]
    AddressInUse(String),

    /// The channel is not open (never opened, or already closed).
    #[error("{0} channel is not open")]
    ChannelClosed(ChannelKind),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Offer/answer or ICE candidate exchange failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}
