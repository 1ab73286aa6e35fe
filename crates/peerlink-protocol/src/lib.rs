//! Wire protocol for peerlink.
//!
//! - **Types** ([`Envelope`], [`ChatPayload`], [`GamePayload`], [`PeerId`])
//!   are the JSON structures that travel between peers.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) turns envelopes into
//!   bytes and back.
//! - **Validation** ([`decode_envelope`], [`parse_payload`]) is the two-pass
//!   boundary check: first the generic envelope shape, then the
//!   payload-specific schema. Anything that fails either pass is dropped by
//!   the caller.
//!
//! ```text
//! Transport (bytes) → Envelope (shape check) → ChatPayload | GamePayload
//! ```

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    ChatPayload, Envelope, GamePayload, Gravitation, PeerId, RadialExplosion,
    Updraft, Vector3, Vortex, WorldAction,
};

use serde::de::DeserializeOwned;

/// First validation pass: decodes bytes into an [`Envelope`] and checks its
/// shape.
///
/// # Errors
/// [`ProtocolError::Decode`] for malformed bytes or missing fields,
/// [`ProtocolError::InvalidMessage`] for a `null` payload or an empty
/// correlation id.
pub fn decode_envelope(
    codec: &impl Codec,
    data: &[u8],
) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope = codec.decode(data)?;
    envelope.validate()?;
    Ok(envelope)
}

/// Second validation pass: interprets an envelope's opaque payload as `T`.
///
/// # Errors
/// [`ProtocolError::Decode`] if the payload does not match `T`'s schema.
pub fn parse_payload<T: DeserializeOwned>(
    payload: &serde_json::Value,
) -> Result<T, ProtocolError> {
    T::deserialize(payload).map_err(ProtocolError::Decode)
}
