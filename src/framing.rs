//! Length-prefixed framing for the query byte stream.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (2 bytes)  |   payload          |
//! | u16 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The decoder keeps the declared length between calls so a frame that arrives
//! in several TCP segments is copied out exactly once, after the last byte
//! shows up. A declared length above the receive capacity is rejected before
//! any of the payload is consumed.
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Errors raised while splitting or building frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("declared frame length {declared} exceeds receive capacity {capacity}")]
    RxBufferSizeExceeded { declared: usize, capacity: usize },
    #[error("payload of {0} bytes does not fit a u16 length prefix")]
    PayloadTooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec for `u16` length-prefixed frames with a hard receive ceiling.
#[derive(Debug, Clone)]
pub struct QueryFrameCodec {
    rx_capacity: usize,
    pending: Option<usize>,
}

impl QueryFrameCodec {
    pub fn new(rx_capacity: usize) -> Self {
        Self {
            rx_capacity,
            pending: None,
        }
    }

    pub fn rx_capacity(&self) -> usize {
        self.rx_capacity
    }

    /// Length of the frame currently being assembled, if its prefix was read.
    pub fn pending_length(&self) -> Option<usize> {
        self.pending
    }
}

impl Decoder for QueryFrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.pending {
            Some(length) => length,
            None => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let declared = u16::from_be_bytes([src[0], src[1]]) as usize;
                if declared > self.rx_capacity {
                    return Err(FrameError::RxBufferSizeExceeded {
                        declared,
                        capacity: self.rx_capacity,
                    });
                }
                src.advance(LENGTH_PREFIX_SIZE);
                self.pending = Some(declared);
                declared
            }
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<&[u8]> for QueryFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(payload, dst)
    }
}

/// Appends one frame (prefix + payload) to `dst`.
pub fn write_frame<B: BufMut>(payload: &[u8], dst: &mut B) -> Result<(), FrameError> {
    let length =
        u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
    dst.put_u16(length);
    dst.put_slice(payload);
    Ok(())
}
