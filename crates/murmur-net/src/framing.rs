//! Length-prefixed JSON framing for the exchange protocol
//!
//! Wire format: a 4-byte big-endian length followed by that many UTF-8 JSON
//! bytes. Unlike a type-byte-tagged binary framing, there is no frame-type
//! octet; the exchange state machine knows which envelope shape
//! (`ClientMessage`, `ServerMessage`, or the short `{count}` frame) to expect
//! at each step.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size. Generous enough for a batch of 140-char messages,
/// small enough that a malicious length prefix can't be used to stall a
/// peer into allocating unbounded memory.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The stream ended with a length prefix that disagreed with the
    /// number of body bytes actually received.
    #[error("frame truncated: stream ended before the declared length was satisfied")]
    Truncated,
}

/// A codec that frames raw bytes (the caller is responsible for JSON
/// (de)serializing the payload into [`murmur_core::wire`] envelope types).
pub struct JsonFrameCodec {
    max_frame_size: usize,
}

impl JsonFrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for JsonFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonFrameCodec {
    type Item = Vec<u8>;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length).to_vec();
        Ok(Some(payload))
    }

    /// A receiver MUST reject frames whose prefix disagrees with the
    /// remaining length. On a stream-level EOF, any bytes
    /// still buffered that didn't form a complete frame means exactly that:
    /// the length prefix promised more than the stream delivered.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated)
                }
            }
        }
    }
}

impl Encoder<Vec<u8>> for JsonFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(FrameError::TooLarge(item.len()));
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

/// Encode a serde-serializable envelope into a length-prefixed frame,
/// ready to write to a socket.
pub fn encode_frame<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(value)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one length-prefixed frame from the front of `buf`, returning the
/// decoded value and the number of bytes consumed. Returns `Ok(None)` if
/// `buf` doesn't yet hold a complete frame.
pub fn decode_frame<T: serde::de::DeserializeOwned>(
    buf: &[u8],
) -> Result<Option<(T, usize)>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(length));
    }
    if buf.len() < 4 + length {
        return Ok(None);
    }
    let body = &buf[4..4 + length];
    let value = serde_json::from_slice(body).map_err(|_| FrameError::Truncated)?;
    Ok(Some((value, 4 + length)))
}
