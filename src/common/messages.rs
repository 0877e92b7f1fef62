//! Serialize and deserialize DHT UDP packets.

pub(crate) mod wire;

use std::net::SocketAddr;

use bytes::Bytes;

use crate::common::{Contact, NodeStatus};
use crate::{Error, Result};

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 16;
/// Packets from versions older than this are rejected as malformed.
pub const PROTOCOL_VERSION_MIN: u8 = 8;
/// First version whose find-node replies report the responder's [NodeStatus].
pub const PROTOCOL_VERSION_XFER_STATUS: u8 = 12;
/// First version that understands [ErrorReply::KeyBlocked].
pub const PROTOCOL_VERSION_BLOCK_KEYS: u8 = 14;

/// Upper bound for a single packet on the wire.
pub const PACKET_MAX_BYTES: usize = 1400;
/// Maximum payload carried by one [DataPacket], leaving room for the header and keys.
pub const MAX_DATA_SIZE: usize = 1000;

/// The only stats request type served.
pub const STATS_TYPE_ORIGINAL: u32 = 1;

#[derive(Debug, PartialEq, Clone)]
pub struct Packet {
    /// Protocol version of the sender.
    pub version: u8,
    /// Correlates a reply with the request that caused it.
    pub connection_id: u64,
    pub transaction_id: u32,

    /// The address the sender advertises for itself.
    pub sender: SocketAddr,
    pub sender_instance_id: u64,
    /// The address the sender sent this packet to, as seen from its side.
    ///
    /// In replies this is the requester's address as observed by the responder.
    pub receiver: SocketAddr,

    pub body: PacketBody,
}

#[derive(Debug, PartialEq, Clone)]
pub enum PacketBody {
    Request(Request),
    Reply(Reply),
}

/// Kind of a request, shared by the matching reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Ping,
    FindNode,
    FindValue,
    Store,
    KeyBlock,
    Stats,
    Data,
}

impl RequestKind {
    pub const ALL: [RequestKind; 7] = [
        RequestKind::Ping,
        RequestKind::FindNode,
        RequestKind::FindValue,
        RequestKind::Store,
        RequestKind::KeyBlock,
        RequestKind::Stats,
        RequestKind::Data,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Ping => "ping",
            RequestKind::FindNode => "find_node",
            RequestKind::FindValue => "find_value",
            RequestKind::Store => "store",
            RequestKind::KeyBlock => "key_block",
            RequestKind::Stats => "stats",
            RequestKind::Data => "data",
        }
    }
}

// === Requests ===

#[derive(Debug, PartialEq, Clone)]
pub enum Request {
    Ping,
    FindNode(FindNodeRequest),
    FindValue(FindValueRequest),
    Store(StoreRequest),
    KeyBlock(KeyBlockRequest),
    Stats(StatsRequest),
    Data(DataPacket),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Ping => RequestKind::Ping,
            Request::FindNode(_) => RequestKind::FindNode,
            Request::FindValue(_) => RequestKind::FindValue,
            Request::Store(_) => RequestKind::Store,
            Request::KeyBlock(_) => RequestKind::KeyBlock,
            Request::Stats(_) => RequestKind::Stats,
            Request::Data(_) => RequestKind::Data,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequest {
    pub target: Bytes,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequest {
    pub key: Bytes,
    pub max_values: u8,
    pub flags: u8,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequest {
    /// Random id previously handed out by the receiver.
    pub random_id: u32,
    pub keys: Vec<Bytes>,
    /// One set of values per key.
    pub value_sets: Vec<Vec<StoredValue>>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct KeyBlockRequest {
    pub random_id: u32,
    pub request: Bytes,
    pub signature: Bytes,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StatsRequest {
    pub stats_type: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPacketType {
    ReadRequest,
    ReadReply,
    WriteRequest,
    WriteReply,
}

/// One chunk (or a request for a range) of a chunked transfer.
#[derive(Debug, PartialEq, Clone)]
pub struct DataPacket {
    pub packet_type: DataPacketType,
    /// Selects the [crate::TransferHandler] on the receiving side.
    pub transfer_key: Bytes,
    /// Handler specific key of the payload being transferred.
    pub request_key: Bytes,
    pub data: Bytes,
    pub start_position: u32,
    pub length: u32,
    pub total_length: u32,
}

impl DataPacket {
    pub fn end_position(&self) -> u32 {
        self.start_position.saturating_add(self.length)
    }
}

// === Replies ===

#[derive(Debug, PartialEq, Clone)]
pub enum Reply {
    Ping,
    FindNode(FindNodeReply),
    FindValue(FindValueReply),
    Store(StoreReply),
    KeyBlock,
    Stats(NodeStats),
    Error(ErrorReply),
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Ping => "ping",
            Reply::FindNode(_) => "find_node",
            Reply::FindValue(_) => "find_value",
            Reply::Store(_) => "store",
            Reply::KeyBlock => "key_block",
            Reply::Stats(_) => "stats",
            Reply::Error(_) => "error",
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeReply {
    /// Random id the requester must echo on later store/key-block requests.
    pub random_id: u32,
    pub node_status: NodeStatus,
    pub estimated_dht_size: u32,
    pub contacts: Vec<Contact>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum FindValueReply {
    Values {
        values: Vec<StoredValue>,
        diversification: u8,
        /// More values follow in another packet.
        continuation: bool,
    },
    Contacts(Vec<Contact>),
}

#[derive(Debug, PartialEq, Clone)]
pub struct StoreReply {
    /// One diversification type per stored key.
    pub diversifications: Vec<u8>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ErrorReply {
    /// The requester's advertised address doesn't match where its packet came from.
    OriginatorAddressWrong(SocketAddr),
    KeyBlocked { request: Bytes, signature: Bytes },
}

/// A value as carried by store requests and find-value replies.
#[derive(Debug, PartialEq, Clone)]
pub struct StoredValue {
    pub version: u32,
    /// Creation time in milliseconds since the unix epoch.
    pub created: u64,
    pub value: Bytes,
    pub originator: Contact,
    pub flags: u8,
}

/// Node statistics returned by stats requests.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct NodeStats {
    pub db_values_stored: u64,
    pub router_nodes: u64,
    pub router_contacts: u64,
    pub estimated_dht_size: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub incoming_requests: u64,
    pub uptime_secs: u64,
}

impl Packet {
    /// Encode this packet, failing if any field overflows its wire width
    /// or the packet is larger than [PACKET_MAX_BYTES].
    pub fn to_bytes(&self) -> Result<Bytes> {
        let bytes = wire::encode(self)?;

        if bytes.len() > PACKET_MAX_BYTES {
            return Err(Error::Encoding("packet larger than PACKET_MAX_BYTES"));
        }

        Ok(bytes)
    }

    /// Decode a packet, failing on truncation, unknown tags or old versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Packet> {
        wire::decode(bytes)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.body, PacketBody::Request(_))
    }
}
