//! Length-hiding padding envelope.
//!
//! Wire layout of one frame:
//!
//! ```text
//! byte 0        flags   bit7 = padding present, bits 0-6 reserved (0)
//! bytes 1-2     payload length, big-endian u16
//! bytes 3..3+N  payload
//! [if bit7]     1 byte padding length L, then L random bytes
//! ```
//!
//! The trailer (length byte plus padding) never exceeds [`MAX_PADDING_SIZE`]
//! bytes. The first [`FIRST_PADDINGS`] frames of a connection always carry a
//! non-zero padding length so short handshake messages do not leave a size
//! signature; later frames draw the padding length from `0..=254`.

use bytes::{Bytes, BytesMut};

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};

/// Size of the fixed frame header.
pub const PADDING_HEADER_SIZE: usize = 3;

/// Upper bound on the trailer (length byte plus random bytes).
pub const MAX_PADDING_SIZE: usize = 255;

/// Number of leading frames that must be padded.
pub const FIRST_PADDINGS: usize = 8;

/// Flags bit announcing a padding trailer.
pub const FLAG_PADDING: u8 = 0x80;

const RESERVED_MASK: u8 = 0x7f;

/// Largest payload one frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Stateful padding encoder for one direction of one connection.
#[derive(Debug)]
pub struct PaddingCodec {
    padded: bool,
    frames: usize,
}

impl PaddingCodec {
    /// Create an encoder. `padded` fixes the flags byte for the whole connection.
    pub fn new(padded: bool) -> Self {
        Self { padded, frames: 0 }
    }

    /// Frames produced so far.
    pub fn frames_written(&self) -> usize {
        self.frames
    }

    fn next_padding_len(&self) -> usize {
        let low = if self.frames < FIRST_PADDINGS { 1 } else { 0 };
        SecureRandom::in_range(low, MAX_PADDING_SIZE - 1)
    }

    /// Wrap `payload` in one frame, appending it to `out`.
    pub fn add_padding(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::Buffer {
                expected: MAX_FRAME_PAYLOAD,
                actual: payload.len(),
            });
        }

        let flags = if self.padded { FLAG_PADDING } else { 0 };
        out.reserve(PADDING_HEADER_SIZE + payload.len() + MAX_PADDING_SIZE);
        out.push(flags);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);

        if self.padded {
            let pad = self.next_padding_len();
            out.push(pad as u8);
            let start = out.len();
            out.resize(start + pad, 0);
            SecureRandom::fill(&mut out[start..]);
        }

        self.frames += 1;
        Ok(())
    }

    /// Strip one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything when `buf` does not yet
    /// hold a complete frame, and an error when the header is malformed.
    pub fn remove_padding(buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if buf.len() < PADDING_HEADER_SIZE {
            return Ok(None);
        }

        let flags = buf[0];
        if flags & RESERVED_MASK != 0 {
            return Err(Error::invalid(format!(
                "padding header has reserved bits set: {:#04x}",
                flags
            )));
        }

        let payload_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let payload_end = PADDING_HEADER_SIZE + payload_len;

        let total = if flags & FLAG_PADDING != 0 {
            if buf.len() < payload_end + 1 {
                return Ok(None);
            }
            payload_end + 1 + buf[payload_end] as usize
        } else {
            payload_end
        };

        if buf.len() < total {
            return Ok(None);
        }

        let frame = buf.split_to(total).freeze();
        Ok(Some(frame.slice(PADDING_HEADER_SIZE..payload_end)))
    }
}
