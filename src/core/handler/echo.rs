// src/core/handler/echo.rs

//! A minimal [`GraphEngine`] that answers every query by echoing its
//! text back as a single record. It exists so the wire protocol can be
//! driven end-to-end without a real graph engine behind it.

use super::{EngineReply, GraphEngine, StreamReply};
use crate::core::protocol::packstream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

/// Echoes the query text of the last RUN back through PULL.
#[derive(Debug, Default)]
pub struct EchoEngine {
    pending: DashMap<u64, String>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A PackStream map with no entries.
fn empty_map() -> Bytes {
    let mut buf = BytesMut::with_capacity(1);
    packstream::write_map_header(&mut buf, 0);
    buf.freeze()
}

#[async_trait]
impl GraphEngine for EchoEngine {
    async fn run(&self, session: u64, payload: Bytes, _in_tx: bool) -> EngineReply {
        let Some((query, _)) = packstream::read_string(&payload) else {
            return EngineReply::Failure {
                code: "Neo.ClientError.Request.Invalid".into(),
                message: "RUN payload does not start with a query string".into(),
            };
        };
        self.pending.insert(session, query.to_string());

        let mut meta = BytesMut::new();
        packstream::write_map_header(&mut meta, 1);
        packstream::write_string(&mut meta, "fields");
        packstream::write_list_header(&mut meta, 1);
        packstream::write_string(&mut meta, "echo");
        EngineReply::Success(meta.freeze())
    }

    async fn pull(&self, session: u64, _payload: Bytes) -> StreamReply {
        let records = match self.pending.remove(&session) {
            Some((_, query)) => {
                let mut record = BytesMut::new();
                packstream::write_list_header(&mut record, 1);
                packstream::write_string(&mut record, &query);
                vec![record.freeze()]
            }
            None => Vec::new(),
        };
        StreamReply {
            records,
            summary: EngineReply::Success(empty_map()),
        }
    }

    async fn discard(&self, session: u64, _payload: Bytes) -> EngineReply {
        self.pending.remove(&session);
        EngineReply::Success(empty_map())
    }

    async fn begin(&self, _session: u64, _payload: Bytes) -> EngineReply {
        EngineReply::Success(empty_map())
    }

    async fn commit(&self, _session: u64) -> EngineReply {
        EngineReply::Success(empty_map())
    }

    async fn rollback(&self, _session: u64) -> EngineReply {
        EngineReply::Success(empty_map())
    }

    fn end_session(&self, session: u64) {
        self.pending.remove(&session);
    }
}
