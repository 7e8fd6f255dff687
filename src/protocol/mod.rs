//! Protocol module - Defines the wire protocol for relayed events
//!
//! Every event travels as one length-prefixed frame:
//! - 1 byte key length
//! - Key bytes (UTF-8)
//! - 2 bytes payload length (big-endian)
//! - Variable length payload
//!
//! The relay server never parses frames; framing is an end-to-end
//! contract between clients.

mod codec;
mod frame;

pub use codec::*;
pub use frame::*;

/// Default port for the relay server
pub const DEFAULT_PORT: u16 = 2000;

/// Largest event key representable by the 1-byte length prefix
pub const MAX_KEY_LEN: usize = u8::MAX as usize;

/// Largest payload representable by the 2-byte length prefix
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Fixed overhead of one wire frame: key length (1) + payload length (2)
pub const FRAME_OVERHEAD: usize = 3;
