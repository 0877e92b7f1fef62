//! Main Crate Error

use std::net::SocketAddr;

use bytes::Bytes;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// dht-udp crate error enum.
pub enum Error {
    /// A field doesn't fit its fixed-width wire representation.
    #[error("Failed to encode packet: {0}")]
    Encoding(&'static str),

    /// Truncated packet, unknown tag or unsupported protocol version.
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("IP filter check failed for {0}")]
    /// The admission filter rejected this address.
    FilteredAddress(SocketAddr),

    /// The reply's connection id didn't match the pending request.
    #[error("Connection id mismatch: expected {expected:#x}, got {received:#x}")]
    CorrelationMismatch { expected: u64, received: u64 },

    #[error("Request timed out")]
    /// No reply was received within the request timeout.
    Timeout,

    #[error("Transfer timed out")]
    /// A chunked transfer didn't complete within its timeout.
    TransferTimeout,

    #[error("Transfer queue limit exceeded")]
    /// Too many concurrent transfers.
    TransferQueueLimit,

    #[error("Transfer {0:#x} is already in progress")]
    /// A transfer queue is already registered for this connection id.
    DuplicateTransfer(u64),

    /// The remote peer disputed our originating address.
    #[error("Originator address disputed, remote sees us as {0}")]
    AddressDisputed(SocketAddr),

    /// The remote peer refused a key that is blocked.
    #[error("Key blocked")]
    KeyBlocked { request: Bytes, signature: Bytes },

    /// No [crate::TransferHandler] registered for a transfer key.
    #[error("No transfer handler registered for key {0:x?}")]
    NoTransferHandler(Vec<u8>),

    /// The reply type doesn't answer the request that was sent.
    #[error("Unexpected reply type: {0}")]
    UnexpectedReply(&'static str),

    /// An address that can't be used as an external address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    /// Stringified [std::io::Error] so errors can be cloned to every waiter.
    IO(String),

    #[error("Transport was shutdown")]
    /// The transport's IO thread is gone.
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error.to_string())
    }
}
