// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a
//! Bolt client connection: transport negotiation, message framing,
//! request dispatch, and the flush policy.

use super::guard::ConnectionGuard;
use super::state_machine::{ProtocolState, request_allowed, step};
use crate::core::BoltGateError;
use crate::core::handler::{EngineReply, StreamReply};
use crate::core::metrics;
use crate::core::protocol::packstream;
use crate::core::protocol::ws;
use crate::core::protocol::{
    BOLT_MAGIC, BoltVersion, Buffer, BufferCursor, RequestType, ResponseType, chunk,
    select_version,
};
use crate::core::state::ServerState;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The incoming WebSocket data frame currently being drained into the
/// Bolt byte stream.
struct WsIngress {
    remaining: u64,
    mask: Option<[u8; 4]>,
    phase: usize,
}

/// A completed outgoing message: its extent in `write_buf` plus the
/// WebSocket opcode it is framed with when the transport is upgraded.
struct Egress {
    from: BufferCursor,
    to: BufferCursor,
    opcode: u8,
}

/// Manages the full lifecycle of a client connection.
pub struct ConnectionHandler<S> {
    stream: S,
    addr: SocketAddr,
    server: Arc<ServerState>,
    session_id: u64,
    shutdown_rx: broadcast::Receiver<()>,
    global_shutdown_rx: broadcast::Receiver<()>,

    /// True once the connection has upgraded to WebSocket transport.
    ws: bool,
    /// Raw WebSocket frames as read from the socket, before de-framing.
    ws_buf: Buffer,
    ws_ingress: Option<WsIngress>,
    /// The logical Bolt byte stream (de-framed and unmasked for WS).
    read_buf: Buffer,
    /// Staged outgoing messages awaiting a flush.
    write_buf: Buffer,
    /// The reassembled body of the message currently being decoded.
    msg_buf: Buffer,
    /// Start of the in-progress outgoing message in `write_buf`.
    write: BufferCursor,
    staged: Vec<Egress>,

    state: ProtocolState,
    version: Option<BoltVersion>,
    reset: bool,
    shutdown: bool,
    processing: bool,
    /// Decoded requests not yet answered, in arrival order.
    pending: VecDeque<(RequestType, Bytes)>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ConnectionHandler<S> {
    /// Creates a new `ConnectionHandler` for an accepted socket.
    pub fn new(
        stream: S,
        addr: SocketAddr,
        server: Arc<ServerState>,
        session_id: u64,
        shutdown_rx: broadcast::Receiver<()>,
        global_shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let write_buf = Buffer::new();
        let write = write_buf.write;
        Self {
            stream,
            addr,
            server,
            session_id,
            shutdown_rx,
            global_shutdown_rx,
            ws: false,
            ws_buf: Buffer::new(),
            ws_ingress: None,
            read_buf: Buffer::new(),
            write_buf,
            msg_buf: Buffer::new(),
            write,
            staged: Vec::new(),
            state: ProtocolState::Negotiation,
            version: None,
            reset: false,
            shutdown: false,
            processing: false,
            pending: VecDeque::new(),
        }
    }

    /// The protocol state the connection is currently in.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// The Bolt version agreed during the handshake, once negotiated.
    pub fn negotiated_version(&self) -> Option<BoltVersion> {
        self.version
    }

    /// The main event loop for the connection.
    pub async fn run(&mut self) -> Result<(), BoltGateError> {
        let _guard = ConnectionGuard::new(Arc::clone(&self.server), self.session_id, self.addr);
        let mut shutdown_rx = self.shutdown_rx.resubscribe();
        let mut global_shutdown_rx = self.global_shutdown_rx.resubscribe();

        let result: Result<(), BoltGateError> = async {
            self.negotiate().await?;
            loop {
                if self.shutdown || self.state == ProtocolState::Defunct {
                    break;
                }
                if let Some((request, payload)) = self.pending.pop_front() {
                    self.process_request(request, payload).await?;
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = global_shutdown_rx.recv() => {
                        info!("Connection handler for {} received global shutdown signal.", self.addr);
                        self.shutdown = true;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Connection handler for {} received kill signal.", self.addr);
                        self.shutdown = true;
                    }
                    res = self.pump() => res?,
                }
            }
            // A reset or replies staged right before teardown still go out.
            if !self.staged.is_empty() || self.reset {
                self.send().await?;
            }
            Ok(())
        }
        .await;

        self.server.engine.end_session(self.session_id);
        let _ = self.stream.shutdown().await;

        match result {
            Err(BoltGateError::ConnectionClosed) => {
                debug!("Connection from {} closed by peer.", self.addr);
                Ok(())
            }
            Err(e) => {
                metrics::PROTOCOL_ERRORS_TOTAL.inc();
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    // --- transport negotiation ---

    /// Performs the optional WebSocket upgrade followed by the Bolt magic
    /// and version handshake.
    async fn negotiate(&mut self) -> Result<(), BoltGateError> {
        if self.server.config.websocket.enabled {
            self.detect_upgrade().await?;
        }

        self.want(20).await?;
        let magic = u32::from_be(self.read_buf.take_u32());
        if magic != BOLT_MAGIC {
            return Err(BoltGateError::BadMagic(magic));
        }
        let mut proposals = [[0u8; 4]; 4];
        for proposal in &mut proposals {
            let mut cursor = self.read_buf.read;
            self.read_buf.read_bytes(&mut cursor, proposal);
            self.read_buf.read = cursor;
        }

        let Some(version) = select_version(&proposals) else {
            self.stage_raw(&[0, 0, 0, 0]);
            self.send().await?;
            return Err(BoltGateError::UnsupportedVersion);
        };
        self.stage_raw(&version.to_handshake_bytes());
        self.send().await?;
        self.version = Some(version);
        debug!(
            "Session {}: negotiated Bolt {}.{} ({})",
            self.session_id,
            version.major,
            version.minor,
            if self.ws { "websocket" } else { "tcp" }
        );
        Ok(())
    }

    /// Peeks the first bytes for an HTTP Upgrade request and, when one is
    /// present, answers it and switches the connection to WebSocket
    /// framing.
    async fn detect_upgrade(&mut self) -> Result<(), BoltGateError> {
        loop {
            match ws::handshake(&mut self.read_buf, &mut self.write_buf) {
                Ok(true) => {
                    // The 101 response is plain HTTP; everything after it
                    // is frame-wrapped.
                    self.write_buf
                        .socket_write(&mut self.stream, self.write_buf.write)
                        .await?;
                    self.stream.flush().await?;
                    self.write_buf.reset();
                    self.write = self.write_buf.write;
                    self.ws = true;
                    metrics::WEBSOCKET_UPGRADES_TOTAL.inc();
                    if let Some(entry) = self.server.clients.get(&self.session_id) {
                        entry.value().0.lock().await.websocket = true;
                    }

                    // Bytes already buffered past the HTTP request are the
                    // first WebSocket frames.
                    let leftover = self.read_buf.available();
                    if leftover > 0 {
                        self.read_buf.take_into(&mut self.ws_buf, leftover);
                    }
                    self.read_buf.reset();
                    self.deframe_ws()?;
                    return Ok(());
                }
                Ok(false) => return Ok(()),
                Err(BoltGateError::IncompleteData) => {
                    if !self.read_buf.socket_read(&mut self.stream).await? {
                        return Err(BoltGateError::ConnectionClosed);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    // --- ingress ---

    /// Reads from the socket once, flushing staged replies first so the
    /// connection never parks on a read while the client waits for an
    /// answer. For WebSocket transport the raw bytes are de-framed into
    /// the Bolt byte stream as they arrive.
    async fn fill(&mut self) -> Result<(), BoltGateError> {
        if !self.staged.is_empty() || self.reset {
            self.send().await?;
        }
        if self.ws {
            if !self.ws_buf.socket_read(&mut self.stream).await? {
                return Err(BoltGateError::ConnectionClosed);
            }
            self.deframe_ws()?;
        } else if !self.read_buf.socket_read(&mut self.stream).await? {
            return Err(BoltGateError::ConnectionClosed);
        }
        Ok(())
    }

    /// Fills and decodes until at least one complete request is pending.
    async fn pump(&mut self) -> Result<(), BoltGateError> {
        while self.pending.is_empty() && !self.shutdown {
            self.fill().await?;
            self.drain_decoded()?;
        }
        Ok(())
    }

    /// Ensures `n` bytes of the Bolt byte stream are buffered.
    async fn want(&mut self, n: usize) -> Result<(), BoltGateError> {
        while self.read_buf.available() < n {
            self.fill().await?;
        }
        Ok(())
    }

    /// Strips WebSocket framing from `ws_buf`, appending unmasked payload
    /// bytes to the Bolt byte stream and answering control frames.
    fn deframe_ws(&mut self) -> Result<(), BoltGateError> {
        loop {
            if let Some(ingress) = &mut self.ws_ingress {
                let span = (ingress.remaining as usize).min(self.ws_buf.available());
                if span > 0 {
                    let start = self.read_buf.write;
                    self.ws_buf.take_into(&mut self.read_buf, span);
                    if let Some(key) = ingress.mask {
                        self.read_buf.xor_range(start, span, key, ingress.phase);
                    }
                    ingress.phase += span;
                    ingress.remaining -= span as u64;
                }
                if ingress.remaining > 0 {
                    return Ok(());
                }
                self.ws_ingress = None;
            }

            let mut cursor = self.ws_buf.read;
            let header = match ws::read_frame_header(&self.ws_buf, &mut cursor) {
                Ok(header) => header,
                Err(BoltGateError::IncompleteData) => {
                    if self.ws_buf.available() == 0 {
                        self.ws_buf.reset();
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match header.opcode {
                ws::OP_BINARY | ws::OP_CONTINUATION => {
                    self.ws_buf.read = cursor;
                    self.ws_ingress = Some(WsIngress {
                        remaining: header.payload_len,
                        mask: header.mask,
                        phase: 0,
                    });
                }
                ws::OP_PING | ws::OP_PONG | ws::OP_CLOSE => {
                    let len = header.payload_len as usize;
                    if len > 125 {
                        return Err(BoltGateError::WebSocket(
                            "oversized control frame".into(),
                        ));
                    }
                    // Wait until the whole control payload is buffered.
                    if Buffer::diff(self.ws_buf.write, cursor) < len {
                        return Ok(());
                    }
                    self.ws_buf.read = cursor;
                    let mut payload = vec![0u8; len];
                    let mut body = self.ws_buf.read;
                    self.ws_buf.read_bytes(&mut body, &mut payload);
                    self.ws_buf.read = body;
                    if let Some(key) = header.mask {
                        for (i, b) in payload.iter_mut().enumerate() {
                            *b ^= key[i % 4];
                        }
                    }
                    match header.opcode {
                        ws::OP_PING => self.stage_frame(ws::OP_PONG, &payload),
                        ws::OP_CLOSE => {
                            self.stage_frame(ws::OP_CLOSE, &payload);
                            self.shutdown = true;
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                other => {
                    return Err(BoltGateError::WebSocket(format!(
                        "unsupported frame opcode {other:#03x}"
                    )));
                }
            }
        }
    }

    /// Decodes every complete message buffered in the Bolt byte stream
    /// into the pending queue. A RESET decoded while a handler is in
    /// flight (`processing`) interrupts the connection: every pending
    /// reply drains as IGNORED until the RESET itself is answered.
    fn drain_decoded(&mut self) -> Result<(), BoltGateError> {
        loop {
            self.msg_buf.reset();
            match chunk::decode_message(
                &mut self.read_buf,
                &mut self.msg_buf,
                self.server.config.max_message_size,
            ) {
                Ok(()) => {
                    // An empty chunk sequence is a link keep-alive.
                    if self.msg_buf.available() == 0 {
                        continue;
                    }
                    let decoded = self.parse_message()?;
                    if self.processing && decoded.0 == RequestType::Reset {
                        self.state = ProtocolState::Interrupted;
                    }
                    self.pending.push_back(decoded);
                }
                Err(BoltGateError::IncompleteData) => {
                    if self.read_buf.available() == 0 {
                        self.read_buf.reset();
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Splits the reassembled message into its request tag and opaque
    /// PackStream payload.
    fn parse_message(&mut self) -> Result<(RequestType, Bytes), BoltGateError> {
        if self.msg_buf.available() < 2 {
            return Err(BoltGateError::Malformed("truncated structure header".into()));
        }
        let marker = self.msg_buf.take_u8();
        if marker & 0xF0 != packstream::TINY_STRUCT {
            return Err(BoltGateError::Malformed(format!(
                "expected a structure marker, got {marker:#04x}"
            )));
        }
        let tag = self.msg_buf.take_u8();
        let request = RequestType::from_tag(tag)?;
        let len = self.msg_buf.available();
        let mut cursor = self.msg_buf.read;
        let payload = self.msg_buf.copy_to_bytes(&mut cursor, len);
        self.msg_buf.read = cursor;
        Ok((request, payload))
    }

    // --- egress ---

    /// Stages raw bytes (no Bolt framing) as one outgoing frame. Used for
    /// the handshake version reply.
    fn stage_raw(&mut self, bytes: &[u8]) {
        let from = self.write_buf.write;
        self.write_buf.push_bytes(bytes);
        self.staged.push(Egress {
            from,
            to: self.write_buf.write,
            opcode: ws::OP_BINARY,
        });
    }

    /// Stages a WebSocket control frame.
    fn stage_frame(&mut self, opcode: u8, payload: &[u8]) {
        let from = self.write_buf.write;
        self.write_buf.push_bytes(payload);
        self.staged.push(Egress {
            from,
            to: self.write_buf.write,
            opcode,
        });
    }

    /// Serializes a response structure as one chunked message: length
    /// slot, structure header, payload, terminator.
    fn stage_response(
        &mut self,
        response: ResponseType,
        payload: Option<&[u8]>,
    ) -> Result<(), BoltGateError> {
        self.write = chunk::begin_message(&mut self.write_buf);
        let mut header = BytesMut::with_capacity(2);
        packstream::write_struct_header(&mut header, response.tag(), payload.is_some() as u8);
        self.write_buf.push_bytes(&header);
        if let Some(payload) = payload {
            self.write_buf.push_bytes(payload);
        }
        chunk::end_message(&mut self.write_buf, self.write)?;
        self.staged.push(Egress {
            from: self.write,
            to: self.write_buf.write,
            opcode: ws::OP_BINARY,
        });
        self.write = self.write_buf.write;
        Ok(())
    }

    /// Serializes the response structure and advances the state machine.
    /// Emission and state advance live in one place so they cannot
    /// diverge.
    fn reply_for(
        &mut self,
        request: RequestType,
        response: ResponseType,
        payload: Option<&[u8]>,
    ) -> Result<(), BoltGateError> {
        self.stage_response(response, payload)?;
        self.state = step(self.state, request, response)?;
        Ok(())
    }

    /// Flushes staged messages, then answers a pending RESET.
    ///
    /// The reset sequence is chosen from the state exactly once: a failed
    /// connection gets an `IGNORED` frame before the `SUCCESS {}`, any
    /// other state just the `SUCCESS {}`. Afterwards the connection is
    /// `Ready` and the flag is cleared.
    async fn send(&mut self) -> Result<(), BoltGateError> {
        self.flush_staged().await?;
        if self.reset {
            self.reset = false;
            if self.state == ProtocolState::Failed {
                self.stage_response(ResponseType::Ignored, None)?;
            }
            let mut meta = BytesMut::with_capacity(1);
            packstream::write_map_header(&mut meta, 0);
            self.stage_response(ResponseType::Success, Some(&meta))?;
            self.state = ProtocolState::Ready;
            self.server.engine.end_session(self.session_id);
            self.flush_staged().await?;
        }
        Ok(())
    }

    /// Writes every staged message to the socket, wrapping each in its
    /// own frame on WebSocket transport, then rewinds the write buffer.
    async fn flush_staged(&mut self) -> Result<(), BoltGateError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        if self.ws {
            for egress in &self.staged {
                let len = Buffer::diff(egress.to, egress.from) as u64;
                let (header, header_len) = ws::encode_frame_header(egress.opcode, len);
                self.stream.write_all(&header[..header_len]).await?;
                self.write_buf
                    .socket_write_range(&mut self.stream, egress.from, egress.to)
                    .await?;
            }
        } else {
            self.write_buf
                .socket_write(&mut self.stream, self.write_buf.write)
                .await?;
        }
        self.stream.flush().await?;
        self.staged.clear();
        self.write_buf.reset();
        self.write = self.write_buf.write;
        Ok(())
    }

    // --- request dispatch ---

    /// Answers one decoded request according to the current state.
    async fn process_request(
        &mut self,
        request: RequestType,
        payload: Bytes,
    ) -> Result<(), BoltGateError> {
        debug!(
            "Session {}: received {:?} in {:?}",
            self.session_id, request, self.state
        );
        self.server.stats.increment_total_messages();
        metrics::MESSAGES_PROCESSED_TOTAL.inc();
        self.touch_client().await;

        // GOODBYE is an immediate, response-less teardown.
        if request == RequestType::Goodbye {
            self.state = ProtocolState::Defunct;
            self.shutdown = true;
            return Ok(());
        }

        // RESET is never answered inline; the flush policy answers it
        // after every pending reply has gone out.
        if request == RequestType::Reset {
            if !request_allowed(self.state, request) {
                return self.fail_request(request);
            }
            self.reset = true;
            return Ok(());
        }

        match self.state {
            ProtocolState::Interrupted => {
                return self.reply_for(request, ResponseType::Ignored, None);
            }
            ProtocolState::Failed
                if matches!(
                    request,
                    RequestType::Run | RequestType::Pull | RequestType::Discard
                ) =>
            {
                return self.reply_for(request, ResponseType::Ignored, None);
            }
            _ => {}
        }

        if !request_allowed(self.state, request) {
            return self.fail_request(request);
        }

        match request {
            RequestType::Hello => {
                let mut meta = BytesMut::new();
                packstream::write_map_header(&mut meta, 2);
                packstream::write_string(&mut meta, "server");
                packstream::write_string(
                    &mut meta,
                    concat!("boltgate/", env!("CARGO_PKG_VERSION")),
                );
                packstream::write_string(&mut meta, "connection_id");
                packstream::write_string(&mut meta, &format!("bolt-{}", self.session_id));
                self.reply_for(request, ResponseType::Success, Some(&meta))
            }
            RequestType::Logon | RequestType::Logoff | RequestType::Route => {
                let mut meta = BytesMut::with_capacity(1);
                packstream::write_map_header(&mut meta, 0);
                self.reply_for(request, ResponseType::Success, Some(&meta))
            }
            RequestType::Run
            | RequestType::Pull
            | RequestType::Discard
            | RequestType::Begin
            | RequestType::Commit
            | RequestType::Rollback => self.dispatch_engine(request, payload).await,
            RequestType::Reset | RequestType::Goodbye => unreachable!(),
        }
    }

    /// Replies FAILURE to a request that has no legal response in the
    /// current state and parks the connection in `Failed`. The transition
    /// table has no row for this pair, so the state is set directly.
    fn fail_request(&mut self, request: RequestType) -> Result<(), BoltGateError> {
        warn!(
            "Session {}: {:?} is not allowed in {:?}",
            self.session_id, request, self.state
        );
        let mut meta = BytesMut::new();
        packstream::write_map_header(&mut meta, 2);
        packstream::write_string(&mut meta, "code");
        packstream::write_string(&mut meta, "Neo.ClientError.Request.Invalid");
        packstream::write_string(&mut meta, "message");
        packstream::write_string(
            &mut meta,
            &format!("{request:?} is not allowed in the current state"),
        );
        self.stage_response(ResponseType::Failure, Some(&meta))?;
        self.state = ProtocolState::Failed;
        Ok(())
    }

    /// Hands a data or transaction request to the engine. Ingress keeps
    /// flowing into the buffers while the call is in flight; a RESET
    /// decoded during that window interrupts the connection and turns the
    /// in-flight reply into IGNORED.
    async fn dispatch_engine(
        &mut self,
        request: RequestType,
        payload: Bytes,
    ) -> Result<(), BoltGateError> {
        let engine = Arc::clone(&self.server.engine);
        let session = self.session_id;
        let in_tx = matches!(
            self.state,
            ProtocolState::TxReady | ProtocolState::TxStreaming
        );
        let mut call: Pin<Box<dyn Future<Output = StreamReply> + Send>> = match request {
            RequestType::Run => Box::pin(async move {
                StreamReply {
                    records: Vec::new(),
                    summary: engine.run(session, payload, in_tx).await,
                }
            }),
            RequestType::Pull => Box::pin(async move { engine.pull(session, payload).await }),
            RequestType::Discard => Box::pin(async move {
                StreamReply {
                    records: Vec::new(),
                    summary: engine.discard(session, payload).await,
                }
            }),
            RequestType::Begin => Box::pin(async move {
                StreamReply {
                    records: Vec::new(),
                    summary: engine.begin(session, payload).await,
                }
            }),
            RequestType::Commit => Box::pin(async move {
                StreamReply {
                    records: Vec::new(),
                    summary: engine.commit(session).await,
                }
            }),
            RequestType::Rollback => Box::pin(async move {
                StreamReply {
                    records: Vec::new(),
                    summary: engine.rollback(session).await,
                }
            }),
            _ => unreachable!(),
        };

        self.processing = true;
        let reply = loop {
            if self.shutdown {
                break (&mut call).await;
            }
            tokio::select! {
                reply = &mut call => break reply,
                res = self.fill() => match res {
                    Ok(()) => {}
                    Err(BoltGateError::ConnectionClosed) => self.shutdown = true,
                    Err(e) => {
                        self.processing = false;
                        return Err(e);
                    }
                },
            }
        };

        // Anything that arrived while the engine was busy is decoded now;
        // a buffered RESET cancels the outstanding work.
        self.drain_decoded()?;
        self.processing = false;
        if self.state == ProtocolState::Interrupted {
            return self.reply_for(request, ResponseType::Ignored, None);
        }

        for record in &reply.records {
            self.reply_for(request, ResponseType::Record, Some(record))?;
        }
        match reply.summary {
            EngineReply::Success(meta) => {
                self.reply_for(request, ResponseType::Success, Some(&meta))
            }
            EngineReply::Failure { code, message } => {
                let mut meta = BytesMut::new();
                packstream::write_map_header(&mut meta, 2);
                packstream::write_string(&mut meta, "code");
                packstream::write_string(&mut meta, &code);
                packstream::write_string(&mut meta, "message");
                packstream::write_string(&mut meta, &message);
                self.reply_for(request, ResponseType::Failure, Some(&meta))
            }
        }
    }

    /// Updates the client's last activity time for monitoring.
    async fn touch_client(&self) {
        if let Some(entry) = self.server.clients.get(&self.session_id) {
            entry.value().0.lock().await.last_message_time = Instant::now();
        }
    }
}
