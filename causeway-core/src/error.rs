//! Error types for the causeway protocol layer

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the protocol layer
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid packet length: expected at least {expected} bytes, got {actual}")]
    InvalidPacketLength { expected: usize, actual: usize },

    #[error("unsupported packet: IP version {version}")]
    UnsupportedPacket { version: u8 },

    #[error("unsupported transport protocol {protocol}")]
    UnsupportedProtocol { protocol: u8 },

    #[error("extra data error: {0}")]
    ExtraData(#[from] serde_json::Error),

    #[error("access authority error: {0}")]
    Authority(String),
}
