// src/core/protocol/chunk.rs

//! Bolt message chunking.
//!
//! On the wire a Bolt message is a sequence of `(u16 length, bytes)`
//! chunks terminated by a zero-length chunk. The encoder reserves the
//! length slot up front, serializes the body, then patches the length in
//! place; the decoder loops until the terminator, reassembling the body
//! into a staging buffer so a payload split across chunks arrives
//! contiguous in stream order.

use super::buffer::{Buffer, BufferCursor};
use crate::core::BoltGateError;

/// The largest body a single chunk can carry.
pub const MAX_CHUNK: usize = 0xFFFF;

/// Starts an outgoing message: remembers the current write position as
/// the start-of-length cursor and reserves the two length bytes.
pub fn begin_message(buf: &mut Buffer) -> BufferCursor {
    let start = buf.write;
    buf.push_u16(0);
    start
}

/// Finishes an outgoing message: patches the length slot at `start` with
/// the serialized size and appends the zero-length terminator.
pub fn end_message(buf: &mut Buffer, start: BufferCursor) -> Result<(), BoltGateError> {
    let body = Buffer::diff(buf.write, start) - 2;
    if body > MAX_CHUNK {
        return Err(BoltGateError::MessageTooLarge(body as u64));
    }
    let mut cursor = start;
    buf.write_u16(&mut cursor, (body as u16).to_be());
    buf.push_u16(0);
    Ok(())
}

/// Decodes one complete message from `src` into `dst`.
///
/// Returns `Err(IncompleteData)` when the buffered bytes do not yet hold
/// a full message; both buffers are left untouched in that case so the
/// caller can read more from the socket and retry. A message whose
/// reassembled body exceeds `max_message` is fatal for the connection.
pub fn decode_message(
    src: &mut Buffer,
    dst: &mut Buffer,
    max_message: usize,
) -> Result<(), BoltGateError> {
    let src_mark = src.read;
    let dst_mark = dst.write;
    let mut total = 0usize;
    loop {
        if src.available() < 2 {
            src.read = src_mark;
            dst.write = dst_mark;
            return Err(BoltGateError::IncompleteData);
        }
        let len = u16::from_be(src.take_u16()) as usize;
        if len == 0 {
            return Ok(());
        }
        total += len;
        if total > max_message {
            return Err(BoltGateError::MessageTooLarge(total as u64));
        }
        if src.available() < len {
            src.read = src_mark;
            dst.write = dst_mark;
            return Err(BoltGateError::IncompleteData);
        }
        src.take_into(dst, len);
    }
}
