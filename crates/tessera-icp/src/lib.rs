//! ICP — the inter-component protocol.
//!
//! A request/response RPC over a local named pipe between the RDP server
//! and the session manager. Frames carry a fixed binary header
//! (`tag`, `is_response`, `status`, `msg_type`, `length`) followed by a
//! serialized payload. SBP traffic (backend ↔ session manager
//! pass-through) reuses the same envelope with backend-owned `msg_type`s
//! and opaque payloads.

pub mod client;
pub mod header;
pub mod msgs;

pub use client::{IcpClient, ServerCall};
pub use header::{IcpHeader, IcpStatus, HEADER_LEN};

/// Endpoint the session manager listens on.
pub const ICP_ENDPOINT: &str = "\\\\.\\pipe\\tessera_session_manager";

/// ICP protocol version. Peers at 1.1 or newer understand
/// [`msgs::MSG_PROPERTY_BULK`].
pub const ICP_VERSION_MAJOR: u32 = 1;
pub const ICP_VERSION_MINOR: u32 = 1;

/// Default budget for a synchronous call before it is marked aborted.
pub const CALL_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum IcpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("call timed out")]
    Timeout,
    #[error("transport closed")]
    Disconnected,
    #[error("peer answered with status {0:?}")]
    Status(IcpStatus),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Wire(#[from] tessera_wire::WireError),
}

pub(crate) fn encode_payload<T: serde::Serialize>(
    kind: &'static str,
    value: &T,
) -> Result<Vec<u8>, IcpError> {
    serde_json::to_vec(value).map_err(|source| IcpError::Payload { kind, source })
}

pub(crate) fn decode_payload<'a, T: serde::Deserialize<'a>>(
    kind: &'static str,
    data: &'a [u8],
) -> Result<T, IcpError> {
    serde_json::from_slice(data).map_err(|source| IcpError::Payload { kind, source })
}
