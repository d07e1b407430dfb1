//! Channel IDs carried in the frame header.
//!
//! The channel is derived from the envelope kind and checked again on
//! decode; a mismatch means the frame is malformed.

/// Registry bookkeeping, handshakes and inspection queries.
pub const CONTROL: u16 = 0;

/// Topic data published between peers.
pub const DATA: u16 = 1;

/// Liveness signals.
pub const HEARTBEAT: u16 = 2;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        DATA => "DATA",
        HEARTBEAT => "HEARTBEAT",
        _ => "UNKNOWN",
    }
}

/// Returns true if the channel ID is one this protocol uses.
pub fn is_known(id: u16) -> bool {
    id <= HEARTBEAT
}
