// src/core/protocol/packstream.rs

//! Minimal PackStream emission for the reply path.
//!
//! The framer treats request payloads as opaque bytes; the only
//! PackStream this crate produces itself is the structure header of each
//! response plus the small metadata maps of SUCCESS/FAILURE replies, so
//! only the markers those need are implemented. Values an engine streams
//! back in RECORD messages are pre-encoded by the engine.

use bytes::{BufMut, BytesMut};

const TINY_STRING: u8 = 0x80;
const TINY_LIST: u8 = 0x90;
const TINY_MAP: u8 = 0xA0;
/// Marker nibble of a structure header; the low nibble carries the field
/// count. Exposed so the framer can validate incoming message headers.
pub const TINY_STRUCT: u8 = 0xB0;
const NULL: u8 = 0xC0;
const INT_8: u8 = 0xC8;
const INT_16: u8 = 0xC9;
const INT_32: u8 = 0xCA;
const INT_64: u8 = 0xCB;
const STRING_8: u8 = 0xD0;
const STRING_16: u8 = 0xD1;
const STRING_32: u8 = 0xD2;
const LIST_8: u8 = 0xD4;
const LIST_16: u8 = 0xD5;
const MAP_8: u8 = 0xD8;
const MAP_16: u8 = 0xD9;

/// Emits a structure header: marker nibble with the field count, then the
/// signature byte. Bolt structures never exceed 15 fields.
pub fn write_struct_header(buf: &mut BytesMut, tag: u8, fields: u8) {
    debug_assert!(fields <= 0x0F);
    buf.put_u8(TINY_STRUCT | fields);
    buf.put_u8(tag);
}

/// Emits a map header for `n` entries.
pub fn write_map_header(buf: &mut BytesMut, n: usize) {
    if n <= 0x0F {
        buf.put_u8(TINY_MAP | n as u8);
    } else if n <= 0xFF {
        buf.put_u8(MAP_8);
        buf.put_u8(n as u8);
    } else {
        buf.put_u8(MAP_16);
        buf.put_u16(n as u16);
    }
}

/// Emits a list header for `n` items.
pub fn write_list_header(buf: &mut BytesMut, n: usize) {
    if n <= 0x0F {
        buf.put_u8(TINY_LIST | n as u8);
    } else if n <= 0xFF {
        buf.put_u8(LIST_8);
        buf.put_u8(n as u8);
    } else {
        buf.put_u8(LIST_16);
        buf.put_u16(n as u16);
    }
}

/// Emits a UTF-8 string value.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    let len = s.len();
    if len <= 0x0F {
        buf.put_u8(TINY_STRING | len as u8);
    } else if len <= 0xFF {
        buf.put_u8(STRING_8);
        buf.put_u8(len as u8);
    } else if len <= 0xFFFF {
        buf.put_u8(STRING_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(STRING_32);
        buf.put_u32(len as u32);
    }
    buf.put_slice(s.as_bytes());
}

/// Emits an integer in its smallest encoding.
pub fn write_int(buf: &mut BytesMut, value: i64) {
    if (-16..=127).contains(&value) {
        buf.put_i8(value as i8);
    } else if i64::from(value as i8) == value {
        buf.put_u8(INT_8);
        buf.put_i8(value as i8);
    } else if i64::from(value as i16) == value {
        buf.put_u8(INT_16);
        buf.put_i16(value as i16);
    } else if i64::from(value as i32) == value {
        buf.put_u8(INT_32);
        buf.put_i32(value as i32);
    } else {
        buf.put_u8(INT_64);
        buf.put_i64(value);
    }
}

/// Emits a null value.
pub fn write_null(buf: &mut BytesMut) {
    buf.put_u8(NULL);
}

/// Reads a leading string value from a payload, returning the string and
/// the number of bytes it occupied. Used by engines that only need to
/// peek the query text of a RUN payload.
pub fn read_string(payload: &[u8]) -> Option<(&str, usize)> {
    let marker = *payload.first()?;
    let (len, header) = match marker {
        m if m & 0xF0 == TINY_STRING => ((m & 0x0F) as usize, 1),
        STRING_8 => (*payload.get(1)? as usize, 2),
        STRING_16 => (
            u16::from_be_bytes([*payload.get(1)?, *payload.get(2)?]) as usize,
            3,
        ),
        STRING_32 => (
            u32::from_be_bytes([
                *payload.get(1)?,
                *payload.get(2)?,
                *payload.get(3)?,
                *payload.get(4)?,
            ]) as usize,
            5,
        ),
        _ => return None,
    };
    let raw = payload.get(header..header + len)?;
    std::str::from_utf8(raw).ok().map(|s| (s, header + len))
}
