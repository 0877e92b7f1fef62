#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod error;

#[cfg(feature = "async")]
pub mod async_transport;
pub mod transport;

pub use crate::common::{
    Contact, DataPacket, DataPacketType, ErrorReply, FindNodeReply, FindNodeRequest,
    FindValueReply, FindValueRequest, Id, KeyBlockRequest, NodeStats, NodeStatus, Packet,
    PacketBody, Reply, Request, RequestKind, StatsRequest, StoreReply, StoreRequest, StoredValue,
    ID_SIZE, MAX_DATA_SIZE, PACKET_MAX_BYTES, PROTOCOL_VERSION, PROTOCOL_VERSION_BLOCK_KEYS,
    PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_XFER_STATUS, STATS_TYPE_ORIGINAL,
};
pub use crate::error::Error;
pub use crate::transport::{
    Config, FindValueOutcome, ReplySender, RequestHandler, Response, RpcOutcome, StoreOutcome,
    TransferHandler, TransferListener, Transport, TransportListener, TransportStats,
};
pub use bytes::Bytes;

/// Alias Result to be the crate Result.
pub type Result<T, E = Error> = std::result::Result<T, E>;

