//! Error types for the ingress layer.
//!
//! Every failure in this crate is scoped to a single connection or to server
//! startup; nothing here ever crosses a connection boundary.

use crate::message::FramingError;
use thiserror::Error;

/// Errors produced by the connection and transport-framing subsystem.
#[derive(Debug, Error)]
pub enum GateError {
    /// Socket-level read/write failure (reset, broken pipe, ...).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed envelope: bad declared length, buffer overrun, checksum mismatch.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// A read or write did not complete within its deadline.
    #[error("{0} deadline expired")]
    Timeout(&'static str),

    /// No registered service matched the protocol identifier byte.
    #[error("no service registered for protocol identifier 0x{0:02x}")]
    ProtocolMismatch(u8),

    /// The connection exceeded the configured packets-per-second ceiling.
    #[error("packet rate exceeded the configured ceiling")]
    RateLimited,

    /// The bound handler rejected the session in `on_recv_first_message`.
    #[error("session rejected by protocol handler: {0}")]
    SessionRejected(String),

    /// The connection is already logically disconnected.
    #[error("connection closed")]
    Closed,

    /// Listener setup or other network-level failure outside a connection.
    #[error("network error: {0}")]
    Network(String),

    /// Invalid service registration (duplicate identifier, mixed exclusivity).
    #[error("service registration error: {0}")]
    ServiceRegistration(String),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GateError>;
