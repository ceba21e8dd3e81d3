// tests/integration/test_helpers.rs

//! Shared plumbing for the integration tests: a scripted engine, an
//! in-process server, and a minimal Bolt client.

use async_trait::async_trait;
use boltgate::config::Config;
use boltgate::connection::ConnectionHandler;
use boltgate::core::handler::{EngineReply, GraphEngine, StreamReply};
use boltgate::core::protocol::packstream;
use boltgate::core::state::{ClientInfo, ServerState};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, broadcast};

// Response signature bytes, for assertions.
pub const SUCCESS: u8 = 0x70;
pub const RECORD: u8 = 0x71;
pub const IGNORED: u8 = 0x7E;
pub const FAILURE: u8 = 0x7F;

/// A scripted engine: queries containing "garbage" fail with a syntax
/// error, everything else succeeds and yields a single `[1]` record on
/// PULL. A test can gate the next PULL on a `Notify` to hold a stream
/// open while more requests arrive.
#[derive(Default)]
pub struct TestEngine {
    pending: DashMap<u64, String>,
    pull_gate: Mutex<Option<Arc<Notify>>>,
}

impl TestEngine {
    /// Makes the next PULL wait until the returned handle is notified.
    pub async fn gate_next_pull(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.pull_gate.lock().await = Some(gate.clone());
        gate
    }
}

fn empty_map() -> Bytes {
    let mut buf = BytesMut::new();
    packstream::write_map_header(&mut buf, 0);
    buf.freeze()
}

#[async_trait]
impl GraphEngine for TestEngine {
    async fn run(&self, session: u64, payload: Bytes, _in_tx: bool) -> EngineReply {
        let Some((query, _)) = packstream::read_string(&payload) else {
            return EngineReply::Failure {
                code: "Neo.ClientError.Request.Invalid".into(),
                message: "missing query string".into(),
            };
        };
        if query.contains("garbage") {
            return EngineReply::Failure {
                code: "Neo.ClientError.Statement.SyntaxError".into(),
                message: format!("Invalid input '{query}'"),
            };
        }
        self.pending.insert(session, query.to_string());
        let mut meta = BytesMut::new();
        packstream::write_map_header(&mut meta, 1);
        packstream::write_string(&mut meta, "fields");
        packstream::write_list_header(&mut meta, 1);
        packstream::write_string(&mut meta, "1");
        EngineReply::Success(meta.freeze())
    }

    async fn pull(&self, session: u64, _payload: Bytes) -> StreamReply {
        let gate = self.pull_gate.lock().await.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let records = match self.pending.remove(&session) {
            Some(_) => {
                let mut record = BytesMut::new();
                packstream::write_list_header(&mut record, 1);
                packstream::write_int(&mut record, 1);
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

/// An in-process server bound to an ephemeral port.
pub struct TestContext {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub engine: Arc<TestEngine>,
    // Held so per-connection global shutdown receivers stay open.
    _shutdown_tx: broadcast::Sender<()>,
}

impl TestContext {
    pub async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_test_writer()
            .try_init();

        let engine = Arc::new(TestEngine::default());
        let state = ServerState::new(Config::default(), engine.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);

        let accept_state = state.clone();
        let accept_shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut session_id = 0u64;
            while let Ok((socket, peer)) = listener.accept().await {
                session_id += 1;
                let (conn_shutdown_tx, conn_shutdown_rx) = broadcast::channel(1);
                let global_shutdown_rx = accept_shutdown.subscribe();
                let client_info = Arc::new(Mutex::new(ClientInfo {
                    addr: peer,
                    session_id,
                    websocket: false,
                    created: Instant::now(),
                    last_message_time: Instant::now(),
                }));
                accept_state
                    .clients
                    .insert(session_id, (client_info, conn_shutdown_tx));

                let state = accept_state.clone();
                tokio::spawn(async move {
                    let mut handler = ConnectionHandler::new(
                        socket,
                        peer,
                        state,
                        session_id,
                        conn_shutdown_rx,
                        global_shutdown_rx,
                    );
                    let _ = handler.run().await;
                });
            }
        });

        Self {
            addr,
            state,
            engine,
            _shutdown_tx: shutdown_tx,
        }
    }
}

/// A minimal raw-TCP Bolt client.
pub struct BoltClient {
    stream: TcpStream,
}

impl BoltClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    /// Sends the magic and version proposals; returns the negotiated
    /// `(major, minor)`.
    pub async fn handshake(&mut self) -> (u8, u8) {
        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x60, 0x60, 0xB0, 0x17]);
        hello.extend_from_slice(&[0, 0, 4, 5]);
        hello.extend_from_slice(&[0, 0, 0, 5]);
        hello.extend_from_slice(&[0, 0, 0, 0]);
        hello.extend_from_slice(&[0, 0, 0, 0]);
        self.stream.write_all(&hello).await.unwrap();

        let mut chosen = [0u8; 4];
        self.stream.read_exact(&mut chosen).await.unwrap();
        (chosen[3], chosen[2])
    }

    /// Frames and sends one request structure.
    pub async fn send_request(&mut self, body: &[u8]) {
        let mut wire = Vec::with_capacity(body.len() + 4);
        wire.extend_from_slice(&(body.len() as u16).to_be_bytes());
        wire.extend_from_slice(body);
        wire.extend_from_slice(&[0, 0]);
        self.stream.write_all(&wire).await.unwrap();
    }

    /// Reads one response message, returning its tag and payload.
    pub async fn read_message(&mut self) -> (u8, Vec<u8>) {
        let mut body = Vec::new();
        loop {
            let mut len_raw = [0u8; 2];
            self.stream.read_exact(&mut len_raw).await.unwrap();
            let len = u16::from_be_bytes(len_raw) as usize;
            if len == 0 {
                if body.is_empty() {
                    continue; // keep-alive
                }
                break;
            }
            let mut chunk = vec![0u8; len];
            self.stream.read_exact(&mut chunk).await.unwrap();
            body.extend_from_slice(&chunk);
        }
        parse_structure(&body)
    }

    /// True when the server has closed the connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut probe = [0u8; 1];
        matches!(self.stream.read(&mut probe).await, Ok(0) | Err(_))
    }

    /// Direct access to the socket, for tests that speak malformed bytes.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub async fn hello(&mut self) -> (u8, Vec<u8>) {
        self.send_request(&request(0x01, &[field_map()])).await;
        self.read_message().await
    }

    pub async fn logon(&mut self) -> (u8, Vec<u8>) {
        self.send_request(&request(0x6A, &[field_map()])).await;
        self.read_message().await
    }

    pub async fn run(&mut self, query: &str) -> (u8, Vec<u8>) {
        self.send_run(query).await;
        self.read_message().await
    }

    pub async fn send_run(&mut self, query: &str) {
        self.send_request(&request(0x10, &[field_string(query), field_map(), field_map()]))
            .await;
    }

    pub async fn send_pull(&mut self) {
        self.send_request(&request(0x3F, &[field_map()])).await;
    }

    pub async fn pull(&mut self) -> Vec<(u8, Vec<u8>)> {
        self.send_pull().await;
        self.read_stream().await
    }

    /// Reads messages through the terminal (non-RECORD) one.
    pub async fn read_stream(&mut self) -> Vec<(u8, Vec<u8>)> {
        let mut messages = Vec::new();
        loop {
            let message = self.read_message().await;
            let done = message.0 != RECORD;
            messages.push(message);
            if done {
                break;
            }
        }
        messages
    }

    pub async fn begin(&mut self) -> (u8, Vec<u8>) {
        self.send_request(&request(0x11, &[field_map()])).await;
        self.read_message().await
    }

    pub async fn commit(&mut self) -> (u8, Vec<u8>) {
        self.send_request(&request(0x12, &[])).await;
        self.read_message().await
    }

    pub async fn send_reset(&mut self) {
        self.send_request(&request(0x0F, &[])).await;
    }

    pub async fn send_goodbye(&mut self) {
        self.send_request(&request(0x02, &[])).await;
    }
}

/// Builds a request structure from its tag and pre-encoded fields.
pub fn request(tag: u8, fields: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    packstream::write_struct_header(&mut buf, tag, fields.len() as u8);
    let mut body = buf.to_vec();
    for field in fields {
        body.extend_from_slice(field);
    }
    body
}

pub fn field_map() -> Vec<u8> {
    let mut buf = BytesMut::new();
    packstream::write_map_header(&mut buf, 0);
    buf.to_vec()
}

pub fn field_string(s: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    packstream::write_string(&mut buf, s);
    buf.to_vec()
}

/// Splits a reassembled message into its tag and payload.
pub fn parse_structure(body: &[u8]) -> (u8, Vec<u8>) {
    assert!(body.len() >= 2, "message too short: {body:?}");
    assert_eq!(body[0] & 0xF0, 0xB0, "not a structure: {body:?}");
    (body[1], body[2..].to_vec())
}

/// True when the payload contains the given text (for spot-checking
/// metadata without a full PackStream decoder).
pub fn payload_contains(payload: &[u8], needle: &str) -> bool {
    payload
        .windows(needle.len())
        .any(|window| window == needle.as_bytes())
}
