// src/core/handler/mod.rs

//! The seam between the connection layer and the query layer.
//!
//! The connection handler owns the wire; everything a query actually
//! *does* lives behind [`GraphEngine`]. Replies cross the seam as opaque
//! PackStream payloads so the framing layer never needs to understand
//! graph values.

pub mod echo;

use async_trait::async_trait;
use bytes::Bytes;

pub use echo::EchoEngine;

/// The terminal reply for one request.
#[derive(Debug, Clone)]
pub enum EngineReply {
    /// SUCCESS carrying a PackStream-encoded metadata map (may be empty).
    Success(Bytes),
    /// FAILURE with a Neo4j-style code and a human-readable message.
    Failure { code: String, message: String },
}

/// A batch of RECORD payloads followed by the terminal summary.
#[derive(Debug, Clone)]
pub struct StreamReply {
    /// One PackStream-encoded value list per record, in stream order.
    pub records: Vec<Bytes>,
    pub summary: EngineReply,
}

/// The query layer contract. One engine instance serves every
/// connection; per-session state is keyed by the session id.
#[async_trait]
pub trait GraphEngine: Send + Sync + 'static {
    /// Executes a RUN request. The payload is the opaque PackStream body
    /// of the request (query, parameters, extra), `in_tx` tells the
    /// engine whether an explicit transaction is open.
    async fn run(&self, session: u64, payload: Bytes, in_tx: bool) -> EngineReply;

    /// Streams records for a PULL request.
    async fn pull(&self, session: u64, payload: Bytes) -> StreamReply;

    /// Discards the open result stream.
    async fn discard(&self, session: u64, payload: Bytes) -> EngineReply;

    /// Opens an explicit transaction.
    async fn begin(&self, session: u64, payload: Bytes) -> EngineReply;

    /// Commits the open transaction.
    async fn commit(&self, session: u64) -> EngineReply;

    /// Rolls back the open transaction.
    async fn rollback(&self, session: u64) -> EngineReply;

    /// Drops any state held for the session. Invoked on RESET, GOODBYE,
    /// and disconnect.
    fn end_session(&self, session: u64);
}
