// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum BoltGateError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Invalid Bolt handshake magic: {0:#010x}")]
    BadMagic(u32),

    #[error("No mutually supported Bolt version in handshake")]
    UnsupportedVersion,

    #[error("Unknown message tag {0:#04x}")]
    UnknownMessageTag(u8),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message of {0} bytes exceeds the configured maximum")]
    MessageTooLarge(u64),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Illegal {request:?}/{response:?} in state {state:?}")]
    IllegalTransition {
        state: crate::connection::ProtocolState,
        request: crate::core::protocol::RequestType,
        response: crate::core::protocol::ResponseType,
    },

    #[error("Request {0:?} is not allowed in the current state")]
    UnexpectedRequest(crate::core::protocol::RequestType),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for BoltGateError {
    fn clone(&self) -> Self {
        match self {
            BoltGateError::Io(e) => BoltGateError::Io(Arc::clone(e)),
            BoltGateError::IncompleteData => BoltGateError::IncompleteData,
            BoltGateError::ConnectionClosed => BoltGateError::ConnectionClosed,
            BoltGateError::BadMagic(m) => BoltGateError::BadMagic(*m),
            BoltGateError::UnsupportedVersion => BoltGateError::UnsupportedVersion,
            BoltGateError::UnknownMessageTag(t) => BoltGateError::UnknownMessageTag(*t),
            BoltGateError::Malformed(s) => BoltGateError::Malformed(s.clone()),
            BoltGateError::MessageTooLarge(n) => BoltGateError::MessageTooLarge(*n),
            BoltGateError::WebSocket(s) => BoltGateError::WebSocket(s.clone()),
            BoltGateError::IllegalTransition {
                state,
                request,
                response,
            } => BoltGateError::IllegalTransition {
                state: *state,
                request: *request,
                response: *response,
            },
            BoltGateError::UnexpectedRequest(r) => BoltGateError::UnexpectedRequest(*r),
            BoltGateError::Internal(s) => BoltGateError::Internal(s.clone()),
        }
    }
}

impl PartialEq for BoltGateError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BoltGateError::Io(e1), BoltGateError::Io(e2)) => e1.to_string() == e2.to_string(),
            (BoltGateError::BadMagic(a), BoltGateError::BadMagic(b)) => a == b,
            (BoltGateError::UnknownMessageTag(a), BoltGateError::UnknownMessageTag(b)) => a == b,
            (BoltGateError::Malformed(a), BoltGateError::Malformed(b)) => a == b,
            (BoltGateError::MessageTooLarge(a), BoltGateError::MessageTooLarge(b)) => a == b,
            (BoltGateError::WebSocket(a), BoltGateError::WebSocket(b)) => a == b,
            (
                BoltGateError::IllegalTransition {
                    state: s1,
                    request: q1,
                    response: r1,
                },
                BoltGateError::IllegalTransition {
                    state: s2,
                    request: q2,
                    response: r2,
                },
            ) => s1 == s2 && q1 == q2 && r1 == r2,
            (BoltGateError::UnexpectedRequest(a), BoltGateError::UnexpectedRequest(b)) => a == b,
            (BoltGateError::Internal(a), BoltGateError::Internal(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for BoltGateError {
    fn from(e: std::io::Error) -> Self {
        BoltGateError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for BoltGateError {
    fn from(e: std::str::Utf8Error) -> Self {
        BoltGateError::Malformed(format!("invalid UTF-8 in payload: {e}"))
    }
}
