//! Protocol module - Defines the wire format for Hubwire messages
//!
//! Every message travels as a single frame:
//! - 4 bytes magic ("HWIR")
//! - 4 bytes body length (big-endian)
//! - 4 bytes sequence number (big-endian)
//! - Variable length body (bincode-encoded [`Envelope`])

mod envelope;
mod codec;

pub use envelope::*;
pub use codec::*;

/// Default port for Hubwire servers
pub const DEFAULT_PORT: u16 = 8080;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x48, 0x57, 0x49, 0x52]; // "HWIR"

/// Default upper bound for a single frame body (10 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
