//! Event frame definition
//!
//! A frame pairs an event key with opaque payload bytes. Size limits are
//! checked on construction so an encoded frame can never be truncated.

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, CodecResult, FRAME_OVERHEAD, MAX_KEY_LEN, MAX_PAYLOAD_LEN};

/// One event: a UTF-8 key and an opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    key: String,
    payload: Bytes,
}

impl Frame {
    /// Create a frame, rejecting keys over 255 bytes and payloads over 65535 bytes
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> CodecResult<Self> {
        let key = key.into();
        let payload = payload.into();

        if key.len() > MAX_KEY_LEN {
            return Err(CodecError::KeyTooLong(key.len()));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }

        Ok(Self { key, payload })
    }

    /// Event key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Split into key and payload
    pub fn into_parts(self) -> (String, Bytes) {
        (self.key, self.payload)
    }

    /// Number of bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.key.len() + self.payload.len()
    }

    /// Append the wire representation to a buffer
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        // Lengths were validated in `new`, the casts cannot truncate.
        buf.put_u8(self.key.len() as u8);
        buf.put_slice(self.key.as_bytes());
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf.freeze()
    }
}

/// Encode a key and payload straight to wire bytes
pub fn encode(key: &str, payload: &[u8]) -> CodecResult<Bytes> {
    let frame = Frame::new(key, Bytes::copy_from_slice(payload))?;
    Ok(frame.to_bytes())
}
