// src/core/protocol/ws.rs

//! WebSocket transport framing (RFC 6455), server side.
//!
//! Browser-based Bolt drivers speak the protocol over WebSocket. The
//! upgrade is detected by peeking the first ingress bytes; once a
//! connection has upgraded, every Bolt message travels inside a binary
//! frame. Client frames are masked, server frames are not.

use super::buffer::{Buffer, BufferCursor};
use crate::core::BoltGateError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// The fixed GUID every accept key is derived with (RFC 6455 §1.3).
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// An upgrade request larger than this is rejected outright.
const MAX_UPGRADE_REQUEST: usize = 8 * 1024;

/// Derives the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Peeks the ingress buffer for an HTTP Upgrade request. When one is
/// found it is consumed, the 101 Switching Protocols response is written
/// to `resp`, and `Ok(true)` is returned. Input that is not HTTP returns
/// `Ok(false)` without consuming anything; an HTTP request whose headers
/// are not fully buffered yet returns `Err(IncompleteData)`.
pub fn handshake(req: &mut Buffer, resp: &mut Buffer) -> Result<bool, BoltGateError> {
    let avail = req.available();
    if avail < 4 {
        return Err(BoltGateError::IncompleteData);
    }
    let mut cursor = req.read;
    let mut head = [0u8; 4];
    req.read_bytes(&mut cursor, &mut head);
    if &head != b"GET " {
        return Ok(false);
    }

    let mut raw = vec![0u8; avail.min(MAX_UPGRADE_REQUEST)];
    cursor = req.read;
    req.read_bytes(&mut cursor, &mut raw);
    let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
        if avail >= MAX_UPGRADE_REQUEST {
            return Err(BoltGateError::WebSocket("oversized upgrade request".into()));
        }
        return Err(BoltGateError::IncompleteData);
    };

    let text = std::str::from_utf8(&raw[..end])?;
    let header = |name: &str| {
        text.lines().find_map(|line| {
            line.split_once(':')
                .filter(|(n, _)| n.trim().eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
        })
    };
    if !header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
        return Err(BoltGateError::WebSocket(
            "HTTP request is not a websocket upgrade".into(),
        ));
    }
    let key = header("sec-websocket-key")
        .ok_or_else(|| BoltGateError::WebSocket("missing Sec-WebSocket-Key".into()))?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    resp.push_bytes(response.as_bytes());

    let mut consumed = req.read;
    consumed.advance(end + 4);
    req.read = consumed;
    Ok(true)
}

/// A parsed WebSocket frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: u8,
    pub payload_len: u64,
    /// The masking key when the mask bit is set. Unmasking is applied
    /// lazily by the caller as payload bytes are consumed.
    pub mask: Option<[u8; 4]>,
}

/// Parses a frame header at `cursor`, advancing it past the header.
/// Returns `Err(IncompleteData)` without moving the cursor when the
/// header is not fully buffered.
pub fn read_frame_header(
    buf: &Buffer,
    cursor: &mut BufferCursor,
) -> Result<FrameHeader, BoltGateError> {
    let avail = Buffer::diff(buf.write, *cursor);
    if avail < 2 {
        return Err(BoltGateError::IncompleteData);
    }
    let mut cur = *cursor;
    let b0 = buf.read_u8(&mut cur);
    let b1 = buf.read_u8(&mut cur);
    let masked = b1 & 0x80 != 0;
    let len7 = b1 & 0x7F;
    let ext = match len7 {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    if avail < 2 + ext + if masked { 4 } else { 0 } {
        return Err(BoltGateError::IncompleteData);
    }
    let payload_len = match len7 {
        126 => u64::from(u16::from_be(buf.read_u16(&mut cur))),
        127 => u64::from_be(buf.read_u64(&mut cur)),
        n => u64::from(n),
    };
    let mask = if masked {
        let mut key = [0u8; 4];
        buf.read_bytes(&mut cur, &mut key);
        Some(key)
    } else {
        None
    };
    *cursor = cur;
    Ok(FrameHeader {
        fin: b0 & 0x80 != 0,
        opcode: b0 & 0x0F,
        payload_len,
        mask,
    })
}

/// Encodes an unmasked server-to-client frame header with the minimal
/// length form: a single length byte up to 125, the 16-bit form up to
/// 0xFFFF, the 64-bit form beyond.
pub fn encode_frame_header(opcode: u8, len: u64) -> ([u8; 10], usize) {
    let mut hdr = [0u8; 10];
    hdr[0] = 0x80 | opcode;
    if len <= 125 {
        hdr[1] = len as u8;
        (hdr, 2)
    } else if len <= 0xFFFF {
        hdr[1] = 126;
        hdr[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        (hdr, 4)
    } else {
        hdr[1] = 127;
        hdr[2..10].copy_from_slice(&len.to_be_bytes());
        (hdr, 10)
    }
}
