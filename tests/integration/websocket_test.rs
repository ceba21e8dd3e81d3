// tests/integration/websocket_test.rs

//! End-to-end scenarios over WebSocket transport.

use super::test_helpers::*;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MASK_KEY: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

/// A minimal WebSocket Bolt client. Outgoing frames are masked as the
/// RFC requires for the client-to-server direction.
pub struct WsClient {
    stream: TcpStream,
}

impl WsClient {
    pub async fn connect_and_upgrade(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = "GET / HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n";
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
            if response.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101"), "unexpected response: {text}");
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        Self { stream }
    }

    pub async fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 14);
        frame.push(0x80 | opcode);
        let len = payload.len();
        if len <= 125 {
            frame.push(0x80 | len as u8);
        } else if len <= 0xFFFF {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
        frame.extend_from_slice(&MASK_KEY);
        frame.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ MASK_KEY[i % 4]),
        );
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Reads one (unmasked) server frame.
    pub async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        self.stream.read_exact(&mut head).await.unwrap();
        let opcode = head[0] & 0x0F;
        assert_eq!(head[1] & 0x80, 0, "server frames must not be masked");
        let len = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).await.unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).await.unwrap();
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await.unwrap();
        (opcode, payload)
    }

    pub async fn bolt_handshake(&mut self) -> (u8, u8) {
        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x60, 0x60, 0xB0, 0x17]);
        hello.extend_from_slice(&[0, 0, 4, 5]);
        hello.extend_from_slice(&[0, 0, 0, 5]);
        hello.extend_from_slice(&[0, 0, 0, 0]);
        hello.extend_from_slice(&[0, 0, 0, 0]);
        self.send_frame(0x2, &hello).await;

        let (opcode, payload) = self.read_frame().await;
        assert_eq!(opcode, 0x2);
        assert_eq!(payload.len(), 4);
        (payload[3], payload[2])
    }

    pub async fn send_request(&mut self, body: &[u8]) {
        let mut wire = Vec::with_capacity(body.len() + 4);
        wire.extend_from_slice(&(body.len() as u16).to_be_bytes());
        wire.extend_from_slice(body);
        wire.extend_from_slice(&[0, 0]);
        self.send_frame(0x2, &wire).await;
    }

    /// Reads the next binary frame and parses the message inside it.
    /// Control frames encountered on the way are skipped.
    pub async fn read_message(&mut self) -> (u8, Vec<u8>) {
        loop {
            let (opcode, payload) = self.read_frame().await;
            if opcode != 0x2 {
                continue;
            }
            let mut body = Vec::new();
            let mut at = 0usize;
            loop {
                let len = u16::from_be_bytes([payload[at], payload[at + 1]]) as usize;
                at += 2;
                if len == 0 {
                    break;
                }
                body.extend_from_slice(&payload[at..at + len]);
                at += len;
            }
            if body.is_empty() {
                continue;
            }
            return parse_structure(&body);
        }
    }

    pub async fn is_closed(&mut self) -> bool {
        let mut probe = [0u8; 1];
        matches!(self.stream.read(&mut probe).await, Ok(0) | Err(_))
    }
}

// Scenario: an RFC 6455 upgrade against the Bolt port, then the whole
// protocol inside binary frames.
#[tokio::test]
async fn test_ws_happy_path() {
    let ctx = TestContext::new().await;
    let mut client = WsClient::connect_and_upgrade(ctx.addr).await;

    assert_eq!(client.bolt_handshake().await, (5, 4));

    client.send_request(&request(0x01, &[field_map()])).await;
    let (tag, payload) = client.read_message().await;
    assert_eq!(tag, SUCCESS);
    assert!(payload_contains(&payload, "boltgate/"));

    client.send_request(&request(0x6A, &[field_map()])).await;
    let (tag, _) = client.read_message().await;
    assert_eq!(tag, SUCCESS);

    client
        .send_request(&request(0x10, &[field_string("RETURN 1"), field_map(), field_map()]))
        .await;
    let (tag, _) = client.read_message().await;
    assert_eq!(tag, SUCCESS);

    client.send_request(&request(0x3F, &[field_map()])).await;
    let (tag, _) = client.read_message().await;
    assert_eq!(tag, RECORD);
    let (tag, _) = client.read_message().await;
    assert_eq!(tag, SUCCESS);

    client.send_request(&request(0x02, &[])).await;
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn test_ws_ping_is_answered_with_pong() {
    let ctx = TestContext::new().await;
    let mut client = WsClient::connect_and_upgrade(ctx.addr).await;
    client.bolt_handshake().await;

    client.send_frame(0x9, b"hi").await;
    let (opcode, payload) = client.read_frame().await;
    assert_eq!(opcode, 0xA);
    assert_eq!(payload, b"hi");
}

#[tokio::test]
async fn test_ws_close_is_echoed() {
    let ctx = TestContext::new().await;
    let mut client = WsClient::connect_and_upgrade(ctx.addr).await;
    client.bolt_handshake().await;

    client.send_frame(0x8, &[]).await;
    let (opcode, _) = client.read_frame().await;
    assert_eq!(opcode, 0x8);
    assert!(client.is_closed().await);
}

// A query long enough to push the client frame into the 16-bit length
// form; the server must parse the extended header.
#[tokio::test]
async fn test_ws_extended_length_frames() {
    let ctx = TestContext::new().await;
    let mut client = WsClient::connect_and_upgrade(ctx.addr).await;
    client.bolt_handshake().await;

    client.send_request(&request(0x01, &[field_map()])).await;
    client.read_message().await;
    client.send_request(&request(0x6A, &[field_map()])).await;
    client.read_message().await;

    let query = format!("RETURN \"{}\"", "x".repeat(300));
    client
        .send_request(&request(0x10, &[field_string(&query), field_map(), field_map()]))
        .await;
    let (tag, _) = client.read_message().await;
    assert_eq!(tag, SUCCESS);

    client.send_request(&request(0x3F, &[field_map()])).await;
    let (tag, _) = client.read_message().await;
    assert_eq!(tag, RECORD);
    let (tag, _) = client.read_message().await;
    assert_eq!(tag, SUCCESS);
}

// Bolt messages split across WebSocket frames must reassemble: the
// chunked envelope is a byte stream independent of frame boundaries.
#[tokio::test]
async fn test_ws_message_split_across_frames() {
    let ctx = TestContext::new().await;
    let mut client = WsClient::connect_and_upgrade(ctx.addr).await;
    client.bolt_handshake().await;

    let body = request(0x01, &[field_map()]);
    let mut wire = Vec::new();
    wire.extend_from_slice(&(body.len() as u16).to_be_bytes());
    wire.extend_from_slice(&body);
    wire.extend_from_slice(&[0, 0]);

    let split = wire.len() / 2;
    client.send_frame(0x2, &wire[..split]).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    client.send_frame(0x2, &wire[split..]).await;

    let (tag, _) = client.read_message().await;
    assert_eq!(tag, SUCCESS);
}
