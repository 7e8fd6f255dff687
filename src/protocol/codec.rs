//! Protocol codec for decoding frames off a byte stream
//!
//! Transports hand over bytes in arbitrary chunks. The [`Decoder`] keeps a
//! small state machine so a frame split across reads is reassembled, and
//! surplus bytes stay buffered for the next frame.

use bytes::{Buf, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::Frame;

/// Default size of a single transport read
pub const DEFAULT_READ_SIZE: usize = 4096;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Key too long: {0} bytes (max: 255)")]
    KeyTooLong(usize),

    #[error("Payload too large: {0} bytes (max: 65535)")]
    PayloadTooLarge(usize),

    #[error("Invalid UTF-8 in event key: {0}")]
    InvalidKey(#[from] std::string::FromUtf8Error),

    #[error("Stream closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// The frame could not be built from the given key/payload
    pub fn is_encoding(&self) -> bool {
        matches!(self, Self::KeyTooLong(_) | Self::PayloadTooLarge(_))
    }

    /// The incoming bytes did not form a valid frame
    pub fn is_decoding(&self) -> bool {
        matches!(self, Self::InvalidKey(_) | Self::Truncated { .. })
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Decodes frames from the wire format
#[derive(Debug, Default)]
pub struct Decoder {
    state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    KeyLength,
    Key {
        length: usize,
    },
    PayloadLength {
        key: String,
    },
    Payload {
        key: String,
        length: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no frame is partially consumed
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::KeyLength)
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<Frame>> {
        loop {
            match std::mem::take(&mut self.state) {
                DecodeState::KeyLength => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let length = buf.get_u8() as usize;
                    self.state = DecodeState::Key { length };
                }
                DecodeState::Key { length } => {
                    if buf.len() < length {
                        self.state = DecodeState::Key { length };
                        return Ok(None);
                    }
                    let raw = buf.split_to(length).to_vec();
                    // State is already back at KeyLength if this fails.
                    let key = String::from_utf8(raw)?;
                    self.state = DecodeState::PayloadLength { key };
                }
                DecodeState::PayloadLength { key } => {
                    if buf.len() < 2 {
                        self.state = DecodeState::PayloadLength { key };
                        return Ok(None);
                    }
                    let length = buf.get_u16() as usize;
                    self.state = DecodeState::Payload { key, length };
                }
                DecodeState::Payload { key, length } => {
                    if buf.len() < length {
                        self.state = DecodeState::Payload { key, length };
                        return Ok(None);
                    }
                    let payload = buf.split_to(length).freeze();
                    return Frame::new(key, payload).map(Some);
                }
            }
        }
    }
}

/// Reads whole frames from an async byte stream
pub struct FrameReader<R> {
    reader: R,
    decoder: Decoder,
    buf: BytesMut,
    read_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_read_size(reader, DEFAULT_READ_SIZE)
    }

    /// Create a reader that makes room for `read_size` bytes before each read
    pub fn with_read_size(reader: R, read_size: usize) -> Self {
        Self {
            reader,
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(read_size),
            read_size: read_size.max(1),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    /// A stream that ends inside a frame yields [`CodecError::Truncated`].
    pub async fn read_frame(&mut self) -> CodecResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }

            self.buf.reserve(self.read_size);
            let n = self.reader.read_buf(&mut self.buf).await?;

            if n == 0 {
                if self.buf.is_empty() && self.decoder.is_idle() {
                    return Ok(None);
                }
                return Err(CodecError::Truncated {
                    buffered: self.buf.len(),
                });
            }
        }
    }
}
