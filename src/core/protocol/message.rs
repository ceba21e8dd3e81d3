// src/core/protocol/message.rs

//! Bolt message tags, the handshake magic, and version negotiation.

use crate::core::BoltGateError;

/// The four magic bytes every Bolt connection must open with.
pub const BOLT_MAGIC: u32 = 0x6060_B017;

/// The protocol major version this server speaks.
pub const SUPPORTED_MAJOR: u8 = 5;
/// The highest minor version supported within [`SUPPORTED_MAJOR`].
pub const SUPPORTED_MINOR_MAX: u8 = 4;

/// A negotiated Bolt protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoltVersion {
    pub major: u8,
    pub minor: u8,
}

impl BoltVersion {
    /// Encodes the version the way the handshake reply expects it:
    /// two reserved bytes, then minor, then major.
    pub fn to_handshake_bytes(self) -> [u8; 4] {
        [0, 0, self.minor, self.major]
    }
}

/// Picks the highest supported version out of the four handshake
/// proposals. Each proposal is four wire bytes: reserved, reserved,
/// minor, major.
pub fn select_version(proposals: &[[u8; 4]; 4]) -> Option<BoltVersion> {
    proposals
        .iter()
        .filter_map(|raw| {
            let (minor, major) = (raw[2], raw[3]);
            (major == SUPPORTED_MAJOR && minor <= SUPPORTED_MINOR_MAX)
                .then_some(BoltVersion { major, minor })
        })
        .max_by_key(|v| (v.major, v.minor))
}

/// Client-to-server message kinds, tagged by their structure signature
/// byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Hello,
    Logon,
    Logoff,
    Run,
    Begin,
    Commit,
    Rollback,
    Discard,
    Pull,
    Route,
    Reset,
    Goodbye,
}

impl RequestType {
    /// Maps a structure signature byte to a request kind.
    pub fn from_tag(tag: u8) -> Result<Self, BoltGateError> {
        match tag {
            0x01 => Ok(RequestType::Hello),
            0x02 => Ok(RequestType::Goodbye),
            0x0F => Ok(RequestType::Reset),
            0x10 => Ok(RequestType::Run),
            0x11 => Ok(RequestType::Begin),
            0x12 => Ok(RequestType::Commit),
            0x13 => Ok(RequestType::Rollback),
            0x2F => Ok(RequestType::Discard),
            0x3F => Ok(RequestType::Pull),
            0x66 => Ok(RequestType::Route),
            0x6A => Ok(RequestType::Logon),
            0x6B => Ok(RequestType::Logoff),
            other => Err(BoltGateError::UnknownMessageTag(other)),
        }
    }

    /// The structure signature byte for this request kind.
    pub fn tag(self) -> u8 {
        match self {
            RequestType::Hello => 0x01,
            RequestType::Goodbye => 0x02,
            RequestType::Reset => 0x0F,
            RequestType::Run => 0x10,
            RequestType::Begin => 0x11,
            RequestType::Commit => 0x12,
            RequestType::Rollback => 0x13,
            RequestType::Discard => 0x2F,
            RequestType::Pull => 0x3F,
            RequestType::Route => 0x66,
            RequestType::Logon => 0x6A,
            RequestType::Logoff => 0x6B,
        }
    }
}

/// Server-to-client message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Success,
    Failure,
    Ignored,
    Record,
}

impl ResponseType {
    /// The structure signature byte for this response kind.
    pub fn tag(self) -> u8 {
        match self {
            ResponseType::Success => 0x70,
            ResponseType::Record => 0x71,
            ResponseType::Ignored => 0x7E,
            ResponseType::Failure => 0x7F,
        }
    }
}
