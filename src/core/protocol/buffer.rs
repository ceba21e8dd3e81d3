// src/core/protocol/buffer.rs

//! A growable byte buffer backed by fixed-size chunks, addressed by
//! lightweight `(chunk, offset)` cursors.
//!
//! The buffer is the staging area between the socket and the framing
//! layers: ingress bytes are appended at the `write` cursor, consumed at
//! the `read` cursor, and framing code patches earlier positions (length
//! slots) through auxiliary cursors. Chunks are never moved or freed
//! while the buffer lives, so a cursor stays valid for the buffer's whole
//! lifetime.
//!
//! All multi-byte accessors work byte-wise, so a value straddling a chunk
//! boundary is always read and written correctly. Integer accessors use
//! native byte order; call sites dealing with network-order fields
//! convert with `to_be`/`from_be`.

use std::pin::Pin;
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// The size of a single backing chunk.
pub const CHUNK_SIZE: usize = 4096;

/// A position inside a [`Buffer`]: the chunk index and the offset within
/// that chunk. Cursors are plain values; they carry no reference to the
/// buffer and are resolved against one on use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BufferCursor {
    pub(crate) chunk: usize,
    pub(crate) offset: usize,
}

impl BufferCursor {
    /// The absolute byte position this cursor addresses.
    pub fn position(&self) -> usize {
        self.chunk * CHUNK_SIZE + self.offset
    }

    /// Moves the cursor forward by `n` bytes, carrying across chunk
    /// boundaries. A cursor may rest exactly at the end of a chunk; it is
    /// rolled onto the next chunk when the next byte is accessed.
    pub fn advance(&mut self, n: usize) {
        self.offset += n;
        if self.offset > CHUNK_SIZE {
            self.chunk += self.offset / CHUNK_SIZE;
            self.offset %= CHUNK_SIZE;
        }
    }

    /// Rolls an end-of-chunk resting position onto the start of the next
    /// chunk so the cursor addresses a real byte slot.
    fn settle(&mut self) {
        if self.offset == CHUNK_SIZE {
            self.chunk += 1;
            self.offset = 0;
        }
    }
}

/// An unbounded byte stream over fixed-size chunks with owned `read` and
/// `write` cursors.
pub struct Buffer {
    chunks: Vec<Box<[u8; CHUNK_SIZE]>>,
    pub read: BufferCursor,
    pub write: BufferCursor,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates a buffer with a single allocated chunk and both cursors at
    /// offset zero.
    pub fn new() -> Self {
        Self {
            chunks: vec![Self::alloc_chunk()],
            read: BufferCursor { chunk: 0, offset: 0 },
            write: BufferCursor { chunk: 0, offset: 0 },
        }
    }

    fn alloc_chunk() -> Box<[u8; CHUNK_SIZE]> {
        Box::new([0; CHUNK_SIZE])
    }

    /// The number of chunks currently backing the buffer.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Returns a cursor addressing `offset` bytes from the start of the
    /// buffer. `offset` must lie within the allocated chunks.
    pub fn cursor_at(&self, offset: usize) -> BufferCursor {
        assert!(offset < self.chunks.len() * CHUNK_SIZE);
        BufferCursor {
            chunk: offset / CHUNK_SIZE,
            offset: offset % CHUNK_SIZE,
        }
    }

    /// The byte distance from `b` up to `a`. `a` must not precede `b`;
    /// misordered cursors are a caller bug.
    pub fn diff(a: BufferCursor, b: BufferCursor) -> usize {
        let (a, b) = (a.position(), b.position());
        assert!(a >= b, "cursor diff with misordered cursors");
        a - b
    }

    /// The number of bytes written but not yet consumed.
    pub fn available(&self) -> usize {
        Self::diff(self.write, self.read)
    }

    /// Rewinds both cursors to the start of the buffer. Chunks stay
    /// allocated for reuse.
    pub fn reset(&mut self) {
        self.read = BufferCursor { chunk: 0, offset: 0 };
        self.write = BufferCursor { chunk: 0, offset: 0 };
    }

    fn grow_to(&mut self, chunk: usize) {
        while chunk >= self.chunks.len() {
            self.chunks.push(Self::alloc_chunk());
        }
    }

    // --- byte-wise primitives ---

    fn read_byte(&self, cursor: &mut BufferCursor) -> u8 {
        cursor.settle();
        let b = self.chunks[cursor.chunk][cursor.offset];
        cursor.offset += 1;
        b
    }

    fn write_byte(&mut self, cursor: &mut BufferCursor, b: u8) {
        cursor.settle();
        self.grow_to(cursor.chunk);
        self.chunks[cursor.chunk][cursor.offset] = b;
        cursor.offset += 1;
    }

    // --- integer reads (native byte order) ---

    /// Reads one byte at the cursor and advances it.
    pub fn read_u8(&self, cursor: &mut BufferCursor) -> u8 {
        debug_assert!(Self::diff(self.write, *cursor) >= 1);
        self.read_byte(cursor)
    }

    /// Reads a `u16` in native byte order, advancing the cursor. The read
    /// may straddle a chunk boundary.
    pub fn read_u16(&self, cursor: &mut BufferCursor) -> u16 {
        debug_assert!(Self::diff(self.write, *cursor) >= 2);
        u16::from_ne_bytes([self.read_byte(cursor), self.read_byte(cursor)])
    }

    /// Reads a `u32` in native byte order, advancing the cursor.
    pub fn read_u32(&self, cursor: &mut BufferCursor) -> u32 {
        debug_assert!(Self::diff(self.write, *cursor) >= 4);
        let mut raw = [0; 4];
        for b in &mut raw {
            *b = self.read_byte(cursor);
        }
        u32::from_ne_bytes(raw)
    }

    /// Reads a `u64` in native byte order, advancing the cursor.
    pub fn read_u64(&self, cursor: &mut BufferCursor) -> u64 {
        debug_assert!(Self::diff(self.write, *cursor) >= 8);
        let mut raw = [0; 8];
        for b in &mut raw {
            *b = self.read_byte(cursor);
        }
        u64::from_ne_bytes(raw)
    }

    // --- integer writes (native byte order) ---

    /// Writes one byte at the cursor, allocating a chunk when the cursor
    /// is at the tail.
    pub fn write_u8(&mut self, cursor: &mut BufferCursor, value: u8) {
        self.write_byte(cursor, value);
    }

    /// Writes a `u16` in native byte order. The write may straddle chunks.
    pub fn write_u16(&mut self, cursor: &mut BufferCursor, value: u16) {
        self.write_bytes(cursor, &value.to_ne_bytes());
    }

    /// Writes a `u32` in native byte order.
    pub fn write_u32(&mut self, cursor: &mut BufferCursor, value: u32) {
        self.write_bytes(cursor, &value.to_ne_bytes());
    }

    /// Writes a `u64` in native byte order.
    pub fn write_u64(&mut self, cursor: &mut BufferCursor, value: u64) {
        self.write_bytes(cursor, &value.to_ne_bytes());
    }

    // --- bulk access ---

    /// Writes `data` at the cursor, spanning and allocating chunks as
    /// needed.
    pub fn write_bytes(&mut self, cursor: &mut BufferCursor, mut data: &[u8]) {
        while !data.is_empty() {
            cursor.settle();
            self.grow_to(cursor.chunk);
            let span = (CHUNK_SIZE - cursor.offset).min(data.len());
            self.chunks[cursor.chunk][cursor.offset..cursor.offset + span]
                .copy_from_slice(&data[..span]);
            cursor.offset += span;
            data = &data[span..];
        }
    }

    /// Copies `len` bytes starting at the cursor into `out`, advancing
    /// the cursor.
    pub fn read_bytes(&self, cursor: &mut BufferCursor, out: &mut [u8]) {
        debug_assert!(Self::diff(self.write, *cursor) >= out.len());
        let mut filled = 0;
        while filled < out.len() {
            cursor.settle();
            let span = (CHUNK_SIZE - cursor.offset).min(out.len() - filled);
            out[filled..filled + span]
                .copy_from_slice(&self.chunks[cursor.chunk][cursor.offset..cursor.offset + span]);
            cursor.offset += span;
            filled += span;
        }
    }

    /// Assembles `len` bytes starting at the cursor into a contiguous
    /// `Bytes`, advancing the cursor.
    pub fn copy_to_bytes(&self, cursor: &mut BufferCursor, len: usize) -> bytes::Bytes {
        let mut out = vec![0; len];
        self.read_bytes(cursor, &mut out);
        bytes::Bytes::from(out)
    }

    /// Block-copies `len` bytes between two buffers, allocating
    /// destination chunks as needed. Both cursors advance.
    pub fn copy_bytes(
        src: &Buffer,
        src_cursor: &mut BufferCursor,
        dst: &mut Buffer,
        dst_cursor: &mut BufferCursor,
        mut len: usize,
    ) {
        debug_assert!(Self::diff(src.write, *src_cursor) >= len);
        while len > 0 {
            src_cursor.settle();
            dst_cursor.settle();
            dst.grow_to(dst_cursor.chunk);
            let span = len
                .min(CHUNK_SIZE - src_cursor.offset)
                .min(CHUNK_SIZE - dst_cursor.offset);
            dst.chunks[dst_cursor.chunk][dst_cursor.offset..dst_cursor.offset + span]
                .copy_from_slice(
                    &src.chunks[src_cursor.chunk][src_cursor.offset..src_cursor.offset + span],
                );
            src_cursor.advance(span);
            dst_cursor.advance(span);
            len -= span;
        }
    }

    /// Moves `len` bytes from this buffer's `read` cursor to `dst`'s
    /// `write` cursor.
    pub fn take_into(&mut self, dst: &mut Buffer, len: usize) {
        let mut src_cursor = self.read;
        let mut dst_cursor = dst.write;
        Self::copy_bytes(self, &mut src_cursor, dst, &mut dst_cursor, len);
        self.read = src_cursor;
        dst.write = dst_cursor;
    }

    // --- convenience accessors over the owned cursors ---

    /// Reads one byte at the `read` cursor.
    pub fn take_u8(&mut self) -> u8 {
        let mut cursor = self.read;
        let b = self.read_u8(&mut cursor);
        self.read = cursor;
        b
    }

    /// Reads a native-order `u16` at the `read` cursor.
    pub fn take_u16(&mut self) -> u16 {
        let mut cursor = self.read;
        let v = self.read_u16(&mut cursor);
        self.read = cursor;
        v
    }

    /// Reads a native-order `u32` at the `read` cursor.
    pub fn take_u32(&mut self) -> u32 {
        let mut cursor = self.read;
        let v = self.read_u32(&mut cursor);
        self.read = cursor;
        v
    }

    /// Appends one byte at the `write` cursor.
    pub fn push_u8(&mut self, value: u8) {
        let mut cursor = self.write;
        self.write_u8(&mut cursor, value);
        self.write = cursor;
    }

    /// Appends a native-order `u16` at the `write` cursor.
    pub fn push_u16(&mut self, value: u16) {
        let mut cursor = self.write;
        self.write_u16(&mut cursor, value);
        self.write = cursor;
    }

    /// Appends `data` at the `write` cursor.
    pub fn push_bytes(&mut self, data: &[u8]) {
        let mut cursor = self.write;
        self.write_bytes(&mut cursor, data);
        self.write = cursor;
    }

    /// XORs `len` bytes starting at `start` with the repeating 4-byte
    /// `key`, beginning at `phase` within the key. Used to unmask
    /// WebSocket payloads in place.
    pub(crate) fn xor_range(
        &mut self,
        start: BufferCursor,
        len: usize,
        key: [u8; 4],
        mut phase: usize,
    ) {
        let mut cursor = start;
        for _ in 0..len {
            cursor.settle();
            self.chunks[cursor.chunk][cursor.offset] ^= key[phase % 4];
            cursor.offset += 1;
            phase += 1;
        }
    }

    // --- socket bridging ---

    /// Reads from the socket at the `write` cursor: first into the tail
    /// of the current chunk, then into freshly allocated chunks for as
    /// long as the socket has data ready. Returns `Ok(false)` on EOF
    /// before any byte was read.
    pub async fn socket_read<S: AsyncRead + Unpin>(
        &mut self,
        sock: &mut S,
    ) -> std::io::Result<bool> {
        self.write.settle();
        self.grow_to(self.write.chunk);
        let n = {
            let tail = &mut self.chunks[self.write.chunk][self.write.offset..];
            sock.read(tail).await?
        };
        if n == 0 {
            return Ok(false);
        }
        self.write.advance(n);

        // Drain whatever is immediately available; stop at the first read
        // that leaves the chunk partly filled or would block.
        while self.write.offset == CHUNK_SIZE {
            self.write.settle();
            self.grow_to(self.write.chunk);
            let polled = std::future::poll_fn(|cx| {
                let tail = &mut self.chunks[self.write.chunk][self.write.offset..];
                let mut buf = ReadBuf::new(tail);
                match Pin::new(&mut *sock).poll_read(cx, &mut buf) {
                    Poll::Ready(Ok(())) => Poll::Ready(Ok(Some(buf.filled().len()))),
                    Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                    Poll::Pending => Poll::Ready(Ok(None)),
                }
            })
            .await?;
            match polled {
                // EOF mid-drain surfaces on the next call.
                Some(0) | None => break,
                Some(n) => self.write.advance(n),
            }
        }
        Ok(true)
    }

    /// Writes every byte from the start of the buffer up to `upto` to the
    /// socket.
    pub async fn socket_write<S: AsyncWrite + Unpin>(
        &self,
        sock: &mut S,
        upto: BufferCursor,
    ) -> std::io::Result<()> {
        for chunk in &self.chunks[..upto.chunk] {
            sock.write_all(&chunk[..]).await?;
        }
        if upto.offset > 0 {
            sock.write_all(&self.chunks[upto.chunk][..upto.offset]).await?;
        }
        Ok(())
    }

    /// Writes the bytes between `from` and `to` to the socket.
    pub async fn socket_write_range<S: AsyncWrite + Unpin>(
        &self,
        sock: &mut S,
        from: BufferCursor,
        to: BufferCursor,
    ) -> std::io::Result<()> {
        let mut cursor = from;
        let mut left = Self::diff(to, from);
        while left > 0 {
            cursor.settle();
            let span = (CHUNK_SIZE - cursor.offset).min(left);
            sock.write_all(&self.chunks[cursor.chunk][cursor.offset..cursor.offset + span])
                .await?;
            cursor.advance(span);
            left -= span;
        }
        Ok(())
    }
}
