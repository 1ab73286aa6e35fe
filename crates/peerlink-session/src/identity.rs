//! Identity and correlation-id generation.

use std::time::{SystemTime, UNIX_EPOCH};

use peerlink_protocol::PeerId;
use rand::TryRngCore;
use rand::rngs::OsRng;

/// Generates a fresh peer identity: `"{prefix}-{32 hex chars}"`.
///
/// The 128 random bits come from the OS. If the OS source is unavailable
/// the id falls back to base-36 random bits from the thread RNG followed by
/// the base-36 millisecond timestamp, which is still unique in practice but
/// not unguessable.
pub fn generate_peer_id(prefix: &str) -> PeerId {
    let mut bytes = [0u8; 16];
    let suffix = match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex(&bytes),
        Err(e) => {
            tracing::warn!(error = %e, "OS random source unavailable, using fallback peer id");
            fallback_suffix()
        }
    };
    if prefix.is_empty() {
        PeerId::new(suffix)
    } else {
        PeerId::new(format!("{prefix}-{suffix}"))
    }
}

/// A random 32-character hex token attached to guaranteed sends.
pub(crate) fn correlation_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex(&bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn fallback_suffix() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    format!("{}{}", base36(u64::from(rand::random::<u32>())), base36(millis))
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
