// src/core/protocol/mod.rs

pub mod buffer;
pub mod chunk;
pub mod message;
pub mod packstream;
pub mod ws;

pub use buffer::{Buffer, BufferCursor, CHUNK_SIZE};
pub use message::{BOLT_MAGIC, BoltVersion, RequestType, ResponseType, select_version};
