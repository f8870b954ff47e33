//! The wire protocols spoken between the RDP server and its graphical
//! backends: a length-prefixed, typed message stream over a local named
//! pipe (UNIX domain socket), plus the shared-memory damage buffer that
//! carries the actual framebuffer pixels.

pub mod dmgbuf;
pub mod msg;
pub mod pipe;
pub mod ring;

pub use msg::{MessageHeader, WireMessage, HEADER_LEN};

/// Backend protocol version, exchanged in Version / VersionReply.
pub const PROTOCOL_VERSION_MAJOR: u32 = 1;
pub const PROTOCOL_VERSION_MINOR: u32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("system error: {0}")]
    Os(#[from] rustix::io::Errno),
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    Oversized(usize),
    #[error("transmit ring buffer is full")]
    RingFull,
    #[error("damage buffer is malformed")]
    BadDamageBuffer,
}
