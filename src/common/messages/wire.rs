//! Binary layout of [Packet]s.
//!
//! Every packet starts with the same header, all integers big endian:
//!
//! ```text
//! version:u8 | type:u8 | connection_id:u64 | transaction_id:u32 |
//! sender:address | sender_instance_id:u64 | receiver:address | body...
//! ```
//!
//! An address is `family:u8 (4 or 6) | ip | port:u16`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    DataPacket, DataPacketType, ErrorReply, FindNodeReply, FindNodeRequest, FindValueReply,
    FindValueRequest, KeyBlockRequest, NodeStats, Packet, PacketBody, Reply, Request,
    StatsRequest, StoreReply, StoreRequest, StoredValue, PACKET_MAX_BYTES, PROTOCOL_VERSION_MIN,
    STATS_TYPE_ORIGINAL,
};
use crate::common::{Contact, NodeStatus};
use crate::{Error, Result};

pub const MAX_ADDRESS_SIZE: usize = 1 + 16 + 2;
/// Largest possible header, before any type specific field.
pub const HEADER_SIZE: usize = 1 + 1 + 8 + 4 + MAX_ADDRESS_SIZE + 8 + MAX_ADDRESS_SIZE;
/// Fixed part of a data packet body, without its keys and data.
pub const DATA_HEADER_SIZE: usize = 1 + 1 + 1 + 4 + 4 + 4 + 2;

const PING: u8 = 0x01;
const FIND_NODE: u8 = 0x02;
const FIND_VALUE: u8 = 0x03;
const STORE: u8 = 0x04;
const KEY_BLOCK: u8 = 0x05;
const STATS: u8 = 0x06;
const DATA: u8 = 0x07;

const REPLY_PING: u8 = 0x41;
const REPLY_FIND_NODE: u8 = 0x42;
const REPLY_FIND_VALUE: u8 = 0x43;
const REPLY_STORE: u8 = 0x44;
const REPLY_KEY_BLOCK: u8 = 0x45;
const REPLY_STATS: u8 = 0x46;
const REPLY_ERROR: u8 = 0x4f;

const READ_REQUEST: u8 = 1;
const READ_REPLY: u8 = 2;
const WRITE_REQUEST: u8 = 3;
const WRITE_REPLY: u8 = 4;

const ERROR_ORIGINATOR_ADDRESS_WRONG: u8 = 1;
const ERROR_KEY_BLOCKED: u8 = 2;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

// === Encoding ===

pub(crate) fn encode(packet: &Packet) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(PACKET_MAX_BYTES);

    buf.put_u8(packet.version);
    buf.put_u8(type_tag(&packet.body));
    buf.put_u64(packet.connection_id);
    buf.put_u32(packet.transaction_id);
    put_address(&mut buf, &packet.sender);
    buf.put_u64(packet.sender_instance_id);
    put_address(&mut buf, &packet.receiver);

    match &packet.body {
        PacketBody::Request(request) => encode_request(&mut buf, request)?,
        PacketBody::Reply(reply) => encode_reply(&mut buf, reply)?,
    }

    Ok(buf.freeze())
}

fn type_tag(body: &PacketBody) -> u8 {
    match body {
        PacketBody::Request(request) => match request {
            Request::Ping => PING,
            Request::FindNode(_) => FIND_NODE,
            Request::FindValue(_) => FIND_VALUE,
            Request::Store(_) => STORE,
            Request::KeyBlock(_) => KEY_BLOCK,
            Request::Stats(_) => STATS,
            Request::Data(_) => DATA,
        },
        PacketBody::Reply(reply) => match reply {
            Reply::Ping => REPLY_PING,
            Reply::FindNode(_) => REPLY_FIND_NODE,
            Reply::FindValue(_) => REPLY_FIND_VALUE,
            Reply::Store(_) => REPLY_STORE,
            Reply::KeyBlock => REPLY_KEY_BLOCK,
            Reply::Stats(_) => REPLY_STATS,
            Reply::Error(_) => REPLY_ERROR,
        },
    }
}

fn encode_request(buf: &mut BytesMut, request: &Request) -> Result<()> {
    match request {
        Request::Ping => {}
        Request::FindNode(args) => put_short_bytes(buf, &args.target, "find_node target")?,
        Request::FindValue(args) => {
            put_short_bytes(buf, &args.key, "find_value key")?;
            buf.put_u8(args.max_values);
            buf.put_u8(args.flags);
        }
        Request::Store(args) => {
            if args.keys.len() != args.value_sets.len() {
                return Err(Error::Encoding("store keys and value sets differ in length"));
            }
            if args.keys.len() > u8::MAX as usize {
                return Err(Error::Encoding("too many store keys"));
            }

            buf.put_u32(args.random_id);
            buf.put_u8(args.keys.len() as u8);
            for key in &args.keys {
                put_short_bytes(buf, key, "store key")?;
            }
            for values in &args.value_sets {
                if values.len() > u8::MAX as usize {
                    return Err(Error::Encoding("too many values for a store key"));
                }
                buf.put_u8(values.len() as u8);
                for value in values {
                    put_value(buf, value)?;
                }
            }
        }
        Request::KeyBlock(args) => {
            buf.put_u32(args.random_id);
            put_long_bytes(buf, &args.request, "key block request")?;
            put_long_bytes(buf, &args.signature, "key block signature")?;
        }
        Request::Stats(args) => buf.put_u32(args.stats_type),
        Request::Data(data) => {
            buf.put_u8(match data.packet_type {
                DataPacketType::ReadRequest => READ_REQUEST,
                DataPacketType::ReadReply => READ_REPLY,
                DataPacketType::WriteRequest => WRITE_REQUEST,
                DataPacketType::WriteReply => WRITE_REPLY,
            });
            put_short_bytes(buf, &data.transfer_key, "transfer key")?;
            put_short_bytes(buf, &data.request_key, "transfer request key")?;
            buf.put_u32(data.start_position);
            buf.put_u32(data.length);
            buf.put_u32(data.total_length);
            put_long_bytes(buf, &data.data, "transfer data")?;
        }
    }

    Ok(())
}

fn encode_reply(buf: &mut BytesMut, reply: &Reply) -> Result<()> {
    match reply {
        Reply::Ping | Reply::KeyBlock => {}
        Reply::FindNode(args) => {
            buf.put_u32(args.random_id);
            buf.put_u8(args.node_status.to_u8());
            buf.put_u32(args.estimated_dht_size);
            put_contacts(buf, &args.contacts)?;
        }
        Reply::FindValue(FindValueReply::Values {
            values,
            diversification,
            continuation,
        }) => {
            if values.len() > u16::MAX as usize {
                return Err(Error::Encoding("too many find_value values"));
            }
            buf.put_u8(1);
            buf.put_u8(*diversification);
            buf.put_u8(u8::from(*continuation));
            buf.put_u16(values.len() as u16);
            for value in values {
                put_value(buf, value)?;
            }
        }
        Reply::FindValue(FindValueReply::Contacts(contacts)) => {
            buf.put_u8(0);
            put_contacts(buf, contacts)?;
        }
        Reply::Store(args) => {
            if args.diversifications.len() > u8::MAX as usize {
                return Err(Error::Encoding("too many store diversifications"));
            }
            buf.put_u8(args.diversifications.len() as u8);
            buf.put_slice(&args.diversifications);
        }
        Reply::Stats(stats) => {
            buf.put_u32(STATS_TYPE_ORIGINAL);
            buf.put_u64(stats.db_values_stored);
            buf.put_u64(stats.router_nodes);
            buf.put_u64(stats.router_contacts);
            buf.put_u64(stats.estimated_dht_size);
            buf.put_u64(stats.packets_sent);
            buf.put_u64(stats.packets_received);
            buf.put_u64(stats.incoming_requests);
            buf.put_u64(stats.uptime_secs);
        }
        Reply::Error(ErrorReply::OriginatorAddressWrong(address)) => {
            buf.put_u8(ERROR_ORIGINATOR_ADDRESS_WRONG);
            put_address(buf, address);
        }
        Reply::Error(ErrorReply::KeyBlocked { request, signature }) => {
            buf.put_u8(ERROR_KEY_BLOCKED);
            put_long_bytes(buf, request, "key block request")?;
            put_long_bytes(buf, signature, "key block signature")?;
        }
    }

    Ok(())
}

pub(crate) fn put_address(buf: &mut BytesMut, address: &SocketAddr) {
    match address.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_V4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_V6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(address.port());
}

pub(crate) fn address_len(address: &SocketAddr) -> usize {
    match address {
        SocketAddr::V4(_) => 1 + 4 + 2,
        SocketAddr::V6(_) => 1 + 16 + 2,
    }
}

/// Bytes taken by a [StoredValue] on the wire.
pub(crate) fn value_len(value: &StoredValue) -> usize {
    4 + 8 + 2 + value.value.len() + 1 + address_len(&value.originator.external_address()) + 1
}

fn put_short_bytes(buf: &mut BytesMut, bytes: &[u8], field: &'static str) -> Result<()> {
    if bytes.len() > u8::MAX as usize {
        return Err(Error::Encoding(field));
    }
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);

    Ok(())
}

fn put_long_bytes(buf: &mut BytesMut, bytes: &[u8], field: &'static str) -> Result<()> {
    if bytes.len() > u16::MAX as usize {
        return Err(Error::Encoding(field));
    }
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);

    Ok(())
}

fn put_contacts(buf: &mut BytesMut, contacts: &[Contact]) -> Result<()> {
    if contacts.len() > u16::MAX as usize {
        return Err(Error::Encoding("too many contacts"));
    }
    buf.put_u16(contacts.len() as u16);
    for contact in contacts {
        contact.export_into(buf);
    }

    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &StoredValue) -> Result<()> {
    buf.put_u32(value.version);
    buf.put_u64(value.created);
    put_long_bytes(buf, &value.value, "value")?;
    value.originator.export_into(buf);
    buf.put_u8(value.flags);

    Ok(())
}

// === Decoding ===

pub(crate) fn decode(bytes: &[u8]) -> Result<Packet> {
    let mut buf = bytes;

    let version = get_u8(&mut buf)?;
    if version < PROTOCOL_VERSION_MIN {
        return Err(Error::MalformedPacket("unsupported protocol version"));
    }

    let tag = get_u8(&mut buf)?;
    let connection_id = get_u64(&mut buf)?;
    let transaction_id = get_u32(&mut buf)?;
    let sender = get_address(&mut buf)?;
    let sender_instance_id = get_u64(&mut buf)?;
    let receiver = get_address(&mut buf)?;

    let body = match tag {
        PING..=DATA => PacketBody::Request(decode_request(&mut buf, tag)?),
        REPLY_PING..=REPLY_STATS | REPLY_ERROR => PacketBody::Reply(decode_reply(&mut buf, tag)?),
        _ => return Err(Error::MalformedPacket("unknown packet type")),
    };

    if buf.has_remaining() {
        return Err(Error::MalformedPacket("trailing bytes"));
    }

    Ok(Packet {
        version,
        connection_id,
        transaction_id,
        sender,
        sender_instance_id,
        receiver,
        body,
    })
}

fn decode_request(buf: &mut &[u8], tag: u8) -> Result<Request> {
    Ok(match tag {
        PING => Request::Ping,
        FIND_NODE => Request::FindNode(FindNodeRequest {
            target: get_short_bytes(buf)?,
        }),
        FIND_VALUE => Request::FindValue(FindValueRequest {
            key: get_short_bytes(buf)?,
            max_values: get_u8(buf)?,
            flags: get_u8(buf)?,
        }),
        STORE => {
            let random_id = get_u32(buf)?;
            let key_count = get_u8(buf)? as usize;

            let mut keys = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                keys.push(get_short_bytes(buf)?);
            }

            let mut value_sets = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                let value_count = get_u8(buf)? as usize;
                let mut values = Vec::with_capacity(value_count);
                for _ in 0..value_count {
                    values.push(get_value(buf)?);
                }
                value_sets.push(values);
            }

            Request::Store(StoreRequest {
                random_id,
                keys,
                value_sets,
            })
        }
        KEY_BLOCK => Request::KeyBlock(KeyBlockRequest {
            random_id: get_u32(buf)?,
            request: get_long_bytes(buf)?,
            signature: get_long_bytes(buf)?,
        }),
        STATS => Request::Stats(StatsRequest {
            stats_type: get_u32(buf)?,
        }),
        DATA => {
            let packet_type = match get_u8(buf)? {
                READ_REQUEST => DataPacketType::ReadRequest,
                READ_REPLY => DataPacketType::ReadReply,
                WRITE_REQUEST => DataPacketType::WriteRequest,
                WRITE_REPLY => DataPacketType::WriteReply,
                _ => return Err(Error::MalformedPacket("unknown data packet type")),
            };

            Request::Data(DataPacket {
                packet_type,
                transfer_key: get_short_bytes(buf)?,
                request_key: get_short_bytes(buf)?,
                start_position: get_u32(buf)?,
                length: get_u32(buf)?,
                total_length: get_u32(buf)?,
                data: get_long_bytes(buf)?,
            })
        }
        _ => return Err(Error::MalformedPacket("unknown request type")),
    })
}

fn decode_reply(buf: &mut &[u8], tag: u8) -> Result<Reply> {
    Ok(match tag {
        REPLY_PING => Reply::Ping,
        REPLY_KEY_BLOCK => Reply::KeyBlock,
        REPLY_FIND_NODE => Reply::FindNode(FindNodeReply {
            random_id: get_u32(buf)?,
            node_status: NodeStatus::from_u8(get_u8(buf)?),
            estimated_dht_size: get_u32(buf)?,
            contacts: get_contacts(buf)?,
        }),
        REPLY_FIND_VALUE => match get_u8(buf)? {
            0 => Reply::FindValue(FindValueReply::Contacts(get_contacts(buf)?)),
            1 => {
                let diversification = get_u8(buf)?;
                let continuation = get_u8(buf)? != 0;
                let count = get_u16(buf)? as usize;

                let mut values = Vec::with_capacity(count.min(PACKET_MAX_BYTES));
                for _ in 0..count {
                    values.push(get_value(buf)?);
                }

                Reply::FindValue(FindValueReply::Values {
                    values,
                    diversification,
                    continuation,
                })
            }
            _ => return Err(Error::MalformedPacket("invalid find_value reply flag")),
        },
        REPLY_STORE => {
            let count = get_u8(buf)? as usize;
            ensure(buf, count)?;

            Reply::Store(StoreReply {
                diversifications: buf.copy_to_bytes(count).to_vec(),
            })
        }
        REPLY_STATS => {
            if get_u32(buf)? != STATS_TYPE_ORIGINAL {
                return Err(Error::MalformedPacket("unknown stats type"));
            }

            Reply::Stats(NodeStats {
                db_values_stored: get_u64(buf)?,
                router_nodes: get_u64(buf)?,
                router_contacts: get_u64(buf)?,
                estimated_dht_size: get_u64(buf)?,
                packets_sent: get_u64(buf)?,
                packets_received: get_u64(buf)?,
                incoming_requests: get_u64(buf)?,
                uptime_secs: get_u64(buf)?,
            })
        }
        REPLY_ERROR => match get_u8(buf)? {
            ERROR_ORIGINATOR_ADDRESS_WRONG => {
                Reply::Error(ErrorReply::OriginatorAddressWrong(get_address(buf)?))
            }
            ERROR_KEY_BLOCKED => Reply::Error(ErrorReply::KeyBlocked {
                request: get_long_bytes(buf)?,
                signature: get_long_bytes(buf)?,
            }),
            _ => return Err(Error::MalformedPacket("unknown error type")),
        },
        _ => return Err(Error::MalformedPacket("unknown reply type")),
    })
}

fn ensure<B: Buf>(buf: &B, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::MalformedPacket("truncated packet"));
    }

    Ok(())
}

pub(crate) fn get_u8<B: Buf>(buf: &mut B) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16<B: Buf>(buf: &mut B) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32<B: Buf>(buf: &mut B) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64<B: Buf>(buf: &mut B) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_short_bytes<B: Buf>(buf: &mut B) -> Result<Bytes> {
    let len = get_u8(buf)? as usize;
    ensure(buf, len)?;

    Ok(buf.copy_to_bytes(len))
}

fn get_long_bytes<B: Buf>(buf: &mut B) -> Result<Bytes> {
    let len = get_u16(buf)? as usize;
    ensure(buf, len)?;

    Ok(buf.copy_to_bytes(len))
}

pub(crate) fn get_address<B: Buf>(buf: &mut B) -> Result<SocketAddr> {
    let ip = match get_u8(buf)? {
        FAMILY_V4 => {
            let mut octets = [0u8; 4];
            ensure(buf, octets.len())?;
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            let mut octets = [0u8; 16];
            ensure(buf, octets.len())?;
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(Error::MalformedPacket("invalid address family")),
    };

    Ok(SocketAddr::new(ip, get_u16(buf)?))
}

fn get_contacts<B: Buf>(buf: &mut B) -> Result<Vec<Contact>> {
    let count = get_u16(buf)? as usize;

    let mut contacts = Vec::with_capacity(count.min(PACKET_MAX_BYTES));
    for _ in 0..count {
        contacts.push(Contact::import_from(buf)?);
    }

    Ok(contacts)
}

fn get_value<B: Buf>(buf: &mut B) -> Result<StoredValue> {
    Ok(StoredValue {
        version: get_u32(buf)?,
        created: get_u64(buf)?,
        value: get_long_bytes(buf)?,
        originator: Contact::import_from(buf)?,
        flags: get_u8(buf)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{ErrorReply, PROTOCOL_VERSION};

    fn packet(body: PacketBody) -> Packet {
        Packet {
            version: PROTOCOL_VERSION,
            connection_id: 0x8000_0000_dead_beef,
            transaction_id: 42,
            sender: "1.2.3.4:6881".parse().unwrap(),
            sender_instance_id: 7,
            receiver: "[2001:db8::7]:1234".parse().unwrap(),
            body,
        }
    }

    fn value(len: usize) -> StoredValue {
        StoredValue {
            version: 3,
            created: 1_700_000_000_000,
            value: Bytes::from(vec![9; len]),
            originator: Contact::new("5.6.7.8:9".parse().unwrap(), 15),
            flags: 2,
        }
    }

    // Field widths only, some of these packets are larger than PACKET_MAX_BYTES.
    fn assert_round_trip(packet: Packet) {
        let bytes = encode(&packet).unwrap();
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn requests_round_trip() {
        let contact_value = value(0);

        for request in [
            Request::Ping,
            Request::FindNode(FindNodeRequest {
                target: Bytes::from(vec![1; 20]),
            }),
            Request::FindValue(FindValueRequest {
                key: Bytes::from(vec![0xff; u8::MAX as usize]),
                max_values: 16,
                flags: 1,
            }),
            Request::Store(StoreRequest {
                random_id: 99,
                keys: vec![Bytes::from_static(b"k1"), Bytes::new()],
                value_sets: vec![vec![contact_value.clone(), value(u16::MAX as usize)], vec![]],
            }),
            Request::KeyBlock(KeyBlockRequest {
                random_id: 1,
                request: Bytes::from_static(b"req"),
                signature: Bytes::new(),
            }),
            Request::Stats(StatsRequest {
                stats_type: STATS_TYPE_ORIGINAL,
            }),
            Request::Data(DataPacket {
                packet_type: DataPacketType::ReadReply,
                transfer_key: Bytes::from_static(b"xfer"),
                request_key: Bytes::from_static(b"key"),
                data: Bytes::from(vec![5; 100]),
                start_position: 300,
                length: 100,
                total_length: 1000,
            }),
        ] {
            assert_round_trip(packet(PacketBody::Request(request)));
        }
    }

    #[test]
    fn replies_round_trip() {
        let contacts = vec![
            Contact::new("9.9.9.9:1".parse().unwrap(), 16),
            Contact::new("[::1]:2".parse().unwrap(), 12),
        ];

        for reply in [
            Reply::Ping,
            Reply::KeyBlock,
            Reply::FindNode(FindNodeReply {
                random_id: u32::MAX,
                node_status: NodeStatus::Routable,
                estimated_dht_size: 1_000_000,
                contacts: contacts.clone(),
            }),
            Reply::FindValue(FindValueReply::Contacts(vec![])),
            Reply::FindValue(FindValueReply::Values {
                values: vec![value(10), value(0)],
                diversification: 1,
                continuation: true,
            }),
            Reply::Store(StoreReply {
                diversifications: vec![0, 1, 2],
            }),
            Reply::Stats(NodeStats {
                db_values_stored: 1,
                uptime_secs: u64::MAX,
                ..Default::default()
            }),
            Reply::Error(ErrorReply::OriginatorAddressWrong(
                "8.8.4.4:53".parse().unwrap(),
            )),
            Reply::Error(ErrorReply::KeyBlocked {
                request: Bytes::from_static(b"r"),
                signature: Bytes::from_static(b"s"),
            }),
        ] {
            assert_round_trip(packet(PacketBody::Reply(reply)));
        }
    }

    #[test]
    fn oversized_fields_fail_to_encode() {
        let long_key = packet(PacketBody::Request(Request::FindNode(FindNodeRequest {
            target: Bytes::from(vec![0; u8::MAX as usize + 1]),
        })));
        assert!(matches!(long_key.to_bytes(), Err(Error::Encoding(_))));

        let long_value = packet(PacketBody::Request(Request::Store(StoreRequest {
            random_id: 0,
            keys: vec![Bytes::from_static(b"k")],
            value_sets: vec![vec![value(u16::MAX as usize + 1)]],
        })));
        assert!(matches!(long_value.to_bytes(), Err(Error::Encoding(_))));

        let mismatched = packet(PacketBody::Request(Request::Store(StoreRequest {
            random_id: 0,
            keys: vec![Bytes::from_static(b"k")],
            value_sets: vec![],
        })));
        assert!(matches!(mismatched.to_bytes(), Err(Error::Encoding(_))));
    }

    #[test]
    fn packets_larger_than_max_fail_to_encode() {
        let store = |size: usize| {
            packet(PacketBody::Request(Request::Store(StoreRequest {
                random_id: 0,
                keys: vec![Bytes::from_static(b"k")],
                value_sets: vec![vec![value(size)]],
            })))
        };

        let fits = PACKET_MAX_BYTES - encode(&store(0)).unwrap().len();
        assert_eq!(store(fits).to_bytes().unwrap().len(), PACKET_MAX_BYTES);

        assert_eq!(
            store(fits + 1).to_bytes(),
            Err(Error::Encoding("packet larger than PACKET_MAX_BYTES"))
        );
        assert!(encode(&store(3000)).is_ok());
    }

    #[test]
    fn malformed_packets() {
        let bytes = packet(PacketBody::Request(Request::Ping)).to_bytes().unwrap();

        for len in 0..bytes.len() {
            assert!(
                matches!(Packet::from_bytes(&bytes[..len]), Err(Error::MalformedPacket(_))),
                "truncated at {len}"
            );
        }

        let mut old = bytes.to_vec();
        old[0] = PROTOCOL_VERSION_MIN - 1;
        assert_eq!(
            Packet::from_bytes(&old),
            Err(Error::MalformedPacket("unsupported protocol version"))
        );

        let mut unknown = bytes.to_vec();
        unknown[1] = 0x30;
        assert_eq!(
            Packet::from_bytes(&unknown),
            Err(Error::MalformedPacket("unknown packet type"))
        );

        let mut trailing = bytes.to_vec();
        trailing.push(0);
        assert_eq!(
            Packet::from_bytes(&trailing),
            Err(Error::MalformedPacket("trailing bytes"))
        );
    }

    #[test]
    fn value_len_matches_encoding() {
        let v = value(37);
        let mut buf = BytesMut::new();
        put_value(&mut buf, &v).unwrap();

        assert_eq!(buf.len(), value_len(&v));
    }
}
