//! Length-prefixed frame format.
//!
//! Frame layout (4 bytes header + payload):
//!
//! ```text
//! +-------------+------------------------------+
//! | payload_len | payload                      |
//! | 4 bytes BE  | payload_len bytes            |
//! +-------------+------------------------------+
//! ```
//!
//! A frame is only handed out once every payload byte is buffered.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// A single frame carrying exactly one serialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Serialized message bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Returns the encoded size of this frame (prefix + payload).
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.payload.len()
    }

    /// Encodes the frame into a fresh buffer.
    pub fn encode(&self, max_size: usize) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(max_size, &mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `dst`.
    pub fn encode_into(&self, max_size: usize, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = self.payload.len();
        check_size(len, max_size)?;

        dst.reserve(self.encoded_len());
        dst.put_u32(len as u32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Decodes a frame from the front of `buf`, consuming its bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` if the declared
    /// length exceeds `max_size`.
    pub fn decode(buf: &mut BytesMut, max_size: usize) -> Result<Option<Self>, ProtocolError> {
        let Some(len) = peek_len(buf) else {
            return Ok(None);
        };
        check_size(len, max_size)?;

        if buf.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Self { payload }))
    }

    /// Decodes a frame from a borrowed slice without consuming it.
    ///
    /// Returns the frame (if complete) and the number of bytes it occupies,
    /// which is zero when more data is needed.
    pub fn decode_slice(buf: &[u8], max_size: usize) -> Result<(Option<Self>, usize), ProtocolError> {
        let Some(len) = peek_len(buf) else {
            return Ok((None, 0));
        };
        check_size(len, max_size)?;

        let total = LENGTH_PREFIX_SIZE + len;
        match buf.get(LENGTH_PREFIX_SIZE..total) {
            Some(payload) => Ok((Some(Self::new(Bytes::copy_from_slice(payload))), total)),
            None => Ok((None, 0)),
        }
    }
}

/// Reads the declared payload length without consuming anything.
pub fn peek_len(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = buf.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

fn check_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max || size > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}
