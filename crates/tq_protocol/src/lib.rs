//! Wire framing for the TQ game protocol.
//!
//! A frame is laid out as `u16 length | u16 type | payload | signature`,
//! all integers little-endian. The leading length counts the header and
//! payload but not the trailing 8-byte ASCII signature (`"TQClient"` for
//! client-to-server frames, `"TQServer"` for the reverse direction).

pub mod decoder;
pub mod messages;
pub mod packet;

pub use decoder::FrameDecoder;
pub use messages::PacketPayload;
pub use packet::Packet;
use thiserror::Error;

/// Size of the `u16 length | u16 type` frame header.
pub const HEADER_SIZE: usize = 4;

/// Size of the trailing ASCII signature.
pub const SIGNATURE_SIZE: usize = 8;

/// The smallest byte count the decoder will accept as a frame.
pub const MIN_PACKET_SIZE: usize = 10;

/// The largest frame the protocol permits, signature included.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Signature trailing every client-to-server frame.
pub const CLIENT_SIGNATURE: &[u8; SIGNATURE_SIZE] = b"TQClient";

/// Signature trailing every server-to-client frame.
pub const SERVER_SIGNATURE: &[u8; SIGNATURE_SIZE] = b"TQServer";

/// A packet type discriminant as it appears on the wire.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct PacketType(pub u16);

impl PacketType {
    pub const C_MSG_LOGIN_GAME: Self = Self(1001);
    pub const C_MSG_TALK: Self = Self(1004);
    pub const C_MSG_WALK: Self = Self(1005);
    pub const C_MSG_ITEM: Self = Self(1009);
    pub const C_MSG_ACTION: Self = Self(1010);
    pub const LOGIN_GAMA_ENGLISH: Self = Self(1059);
    pub const DH_HANDSHAKE: Self = Self(1060);

    /// A human-readable name for log lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::C_MSG_LOGIN_GAME => "CMsgLoginGame",
            Self::C_MSG_TALK => "CMsgTalk",
            Self::C_MSG_WALK => "CMsgWalk",
            Self::C_MSG_ITEM => "CMsgItem",
            Self::C_MSG_ACTION => "CMsgAction",
            Self::LOGIN_GAMA_ENGLISH => "LoginGamaEnglish",
            Self::DH_HANDSHAKE => "DhHandshake",
            _ => "unknown",
        }
    }
}

impl From<u16> for PacketType {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Errors produced while reading or writing frames.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum CodecError {
    #[error("read of {len} bytes at offset {pos} crosses the {limit}-byte bound")]
    OutOfBounds { pos: usize, len: usize, limit: usize },
    #[error("write of {len} bytes at offset {pos} overflows the {max}-byte frame budget")]
    Overflow { pos: usize, len: usize, max: usize },
    #[error("frame does not end with a known signature")]
    BadSignature,
    #[error("declared length {declared} does not match the {available} bytes available")]
    DeclaredLengthMismatch { declared: usize, available: usize },
    #[error("frame of {size} bytes exceeds the {MAX_PACKET_SIZE}-byte maximum")]
    FrameTooLarge { size: usize },
    #[error("frame of {size} bytes is below the {MIN_PACKET_SIZE}-byte minimum")]
    FrameTooSmall { size: usize },
}

impl CodecError {
    /// Whether the error must tear the connection down (a malformed stream
    /// cannot be resynchronized) rather than just fail the current read.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::OutOfBounds { .. } | Self::Overflow { .. })
    }
}
