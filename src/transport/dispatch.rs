//! Handling of inbound requests.

use std::mem;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{
    messages::wire::{value_len, HEADER_SIZE},
    Contact, ErrorReply, FindNodeReply, FindValueReply, NodeStats, Packet, PacketBody, Reply,
    Request, StoreReply, StoredValue, PACKET_MAX_BYTES, PROTOCOL_VERSION_BLOCK_KEYS,
    STATS_TYPE_ORIGINAL,
};

use super::{lock, Transport};

/// Room left for values in a find-value reply, after the header, the
/// values flag, diversification, continuation flag and value count.
const FIND_VALUE_BODY_MAX_BYTES: usize = PACKET_MAX_BYTES - HEADER_SIZE - 5;

/// The routing layer's side of inbound requests.
///
/// Called from the transport's IO thread, so implementations must not block
/// on the transport (for example by waiting on a [crate::ReplySender]).
pub trait RequestHandler: Send + Sync {
    fn ping_request(&self, _originator: &Contact) {}

    fn key_block_request(&self, _originator: &Contact, _request: &[u8], _signature: &[u8]) {}

    fn stats_request(&self, _originator: &Contact) -> NodeStats {
        NodeStats::default()
    }

    /// Store one set of values per key.
    fn store_request(
        &self,
        _originator: &Contact,
        _keys: &[Bytes],
        _value_sets: &[Vec<StoredValue>],
    ) -> StoreOutcome {
        StoreOutcome::Stored(vec![])
    }

    /// Contacts closest to `target`.
    fn find_node_request(&self, _originator: &Contact, _target: &[u8]) -> Vec<Contact> {
        vec![]
    }

    fn find_value_request(
        &self,
        _originator: &Contact,
        _key: &[u8],
        _max_values: u8,
        _flags: u8,
    ) -> FindValueOutcome {
        FindValueOutcome::Contacts(vec![])
    }

    fn contact_imported(&self, _contact: &Contact) {}

    fn contact_removed(&self, _contact: &Contact) {}

    /// Estimated number of nodes in the DHT, advertised in find-node replies.
    fn estimated_dht_size(&self) -> u32 {
        0
    }

    /// Estimate reported by a remote node in a find-node reply.
    fn set_estimated_dht_size(&self, _size: u32) {}
}

/// Answers pings and stats, stores nothing and knows no contacts.
impl RequestHandler for () {}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    /// Stored, with one diversification type per key.
    Stored(Vec<u8>),
    /// A key is blocked, proven by a signed key-block request.
    Blocked { request: Bytes, signature: Bytes },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FindValueOutcome {
    Values {
        values: Vec<StoredValue>,
        diversification: u8,
    },
    Contacts(Vec<Contact>),
    Blocked {
        request: Bytes,
        signature: Bytes,
    },
}

impl Transport {
    pub(crate) fn handle_request(&self, packet: Packet, from: SocketAddr) {
        let Packet {
            version,
            connection_id,
            transaction_id,
            sender,
            sender_instance_id,
            body,
            ..
        } = packet;

        let PacketBody::Request(request) = body else {
            return;
        };

        let alien = !self.0.contacts.is_known(&from);
        self.0.counters.request_received(request.kind(), alien);

        let mut originator = Contact::remote(from, sender, version, sender_instance_id);

        if let Err(error) = self.check_address(&originator) {
            trace!(context = "dispatch", ?error, "Dropping request");
            return;
        }

        if !originator.address_matches_id() {
            if self.0.contacts.report_once(originator.to_string()) {
                debug!(
                    context = "dispatch",
                    %originator,
                    "Originator address doesn't match its id"
                );

                self.reply(
                    &originator,
                    connection_id,
                    transaction_id,
                    Reply::Error(ErrorReply::OriginatorAddressWrong(from)),
                );
            }
            return;
        }

        self.0.contacts.contact_alive(&originator);

        let bootstrap_node = self.0.config.bootstrap_node;

        let request = match request {
            Request::Data(data) => {
                if !bootstrap_node {
                    self.handle_data(&originator, connection_id, data);
                }
                return;
            }
            request => request,
        };

        let Some(handler) = self.request_handler() else {
            trace!(context = "dispatch", kind = request.kind().name(), "No request handler");
            return;
        };

        if bootstrap_node {
            let answered = match &request {
                Request::FindNode(args) => args.target.as_ref() == originator.id().as_bytes(),
                Request::Stats(_) => true,
                _ => false,
            };

            if !answered {
                trace!(
                    context = "dispatch",
                    kind = request.kind().name(),
                    "Bootstrap node ignoring request"
                );
                return;
            }
        }

        let reply = match request {
            Request::Ping => {
                handler.ping_request(&originator);

                Reply::Ping
            }
            Request::KeyBlock(args) => {
                originator.set_random_id(args.random_id);
                handler.key_block_request(&originator, &args.request, &args.signature);

                Reply::KeyBlock
            }
            Request::Stats(args) => {
                if args.stats_type != STATS_TYPE_ORIGINAL {
                    trace!(
                        context = "dispatch",
                        stats_type = args.stats_type,
                        "Unknown stats type"
                    );
                    return;
                }

                let counters = self.0.counters.snapshot();
                let mut stats = handler.stats_request(&originator);

                stats.packets_sent = counters.packets_sent;
                stats.packets_received = counters.packets_received;
                stats.incoming_requests = counters.incoming_requests();

                Reply::Stats(stats)
            }
            Request::Store(args) => {
                originator.set_random_id(args.random_id);

                match handler.store_request(&originator, &args.keys, &args.value_sets) {
                    StoreOutcome::Stored(diversifications) => {
                        Reply::Store(StoreReply { diversifications })
                    }
                    StoreOutcome::Blocked { request, signature } => blocked_reply(
                        &originator,
                        request,
                        signature,
                        Reply::Store(StoreReply {
                            diversifications: vec![],
                        }),
                    ),
                }
            }
            Request::FindNode(args) => {
                let contacts = handler.find_node_request(&originator, &args.target);

                Reply::FindNode(FindNodeReply {
                    random_id: lock(&self.0.tokens).generate(from.ip()),
                    node_status: lock(&self.0.reachability).node_status(bootstrap_node),
                    estimated_dht_size: handler.estimated_dht_size(),
                    contacts,
                })
            }
            Request::FindValue(args) => {
                let outcome =
                    handler.find_value_request(&originator, &args.key, args.max_values, args.flags);

                match outcome {
                    FindValueOutcome::Values {
                        values,
                        diversification,
                    } => {
                        self.reply_values(
                            &originator,
                            connection_id,
                            transaction_id,
                            values,
                            diversification,
                        );
                        return;
                    }
                    FindValueOutcome::Contacts(contacts) => {
                        Reply::FindValue(FindValueReply::Contacts(contacts))
                    }
                    FindValueOutcome::Blocked { request, signature } => blocked_reply(
                        &originator,
                        request,
                        signature,
                        Reply::FindValue(FindValueReply::Values {
                            values: vec![],
                            diversification: 0,
                            continuation: false,
                        }),
                    ),
                }
            }
            Request::Data(_) => return,
        };

        self.reply(&originator, connection_id, transaction_id, reply);
    }

    // === Private Methods ===

    fn reply(&self, to: &Contact, connection_id: u64, transaction_id: u32, reply: Reply) {
        let address = to.transport_address();
        let packet = self.packet(connection_id, transaction_id, address, PacketBody::Reply(reply));

        match self.0.socket.send(address, &packet) {
            Ok(size) => self.0.counters.packet_sent(size),
            Err(error) => {
                debug!(context = "dispatch", ?error, %to, "Failed to send reply");
            }
        }
    }

    /// Reply with values split over as many packets as needed, every part
    /// but the last flagged as a continuation.
    fn reply_values(
        &self,
        to: &Contact,
        connection_id: u64,
        transaction_id: u32,
        values: Vec<StoredValue>,
        diversification: u8,
    ) {
        let parts = split_values(values);
        let count = parts.len();

        for (i, values) in parts.into_iter().enumerate() {
            self.reply(
                to,
                connection_id,
                transaction_id,
                Reply::FindValue(FindValueReply::Values {
                    values,
                    diversification,
                    continuation: i + 1 < count,
                }),
            );
        }
    }
}

/// Peers too old to understand key blocking get `fallback` instead.
fn blocked_reply(originator: &Contact, request: Bytes, signature: Bytes, fallback: Reply) -> Reply {
    if originator.protocol_version() >= PROTOCOL_VERSION_BLOCK_KEYS {
        Reply::Error(ErrorReply::KeyBlocked { request, signature })
    } else {
        fallback
    }
}

fn split_values(values: Vec<StoredValue>) -> Vec<Vec<StoredValue>> {
    let mut parts = vec![];
    let mut current = vec![];
    let mut size = 0;

    for value in values {
        let length = value_len(&value);

        if !current.is_empty() && size + length > FIND_VALUE_BODY_MAX_BYTES {
            parts.push(mem::take(&mut current));
            size = 0;
        }

        size += length;
        current.push(value);
    }

    parts.push(current);

    parts
}

#[cfg(test)]
mod test {
    use super::*;

    fn value(size: usize) -> StoredValue {
        StoredValue {
            version: 1,
            created: 1_700_000_000_000,
            value: Bytes::from(vec![1; size]),
            originator: Contact::new("9.9.9.9:6881".parse().unwrap(), 16),
            flags: 0,
        }
    }

    #[test]
    fn values_split_within_packet_size() {
        let parts = split_values((0..10).map(|_| value(300)).collect());

        assert!(parts.len() > 1);
        assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), 10);

        for part in &parts {
            assert!(part.iter().map(value_len).sum::<usize>() <= FIND_VALUE_BODY_MAX_BYTES);
        }
    }

    #[test]
    fn no_values_is_one_empty_part() {
        assert_eq!(split_values(vec![]), vec![Vec::<StoredValue>::new()]);
    }

    #[test]
    fn blocked_reply_depends_on_version() {
        let request = Bytes::from_static(b"request");
        let signature = Bytes::from_static(b"signature");
        let fallback = Reply::Store(StoreReply {
            diversifications: vec![],
        });

        let new_peer = Contact::new("9.9.9.9:6881".parse().unwrap(), PROTOCOL_VERSION_BLOCK_KEYS);
        assert_eq!(
            blocked_reply(&new_peer, request.clone(), signature.clone(), fallback.clone()),
            Reply::Error(ErrorReply::KeyBlocked {
                request: request.clone(),
                signature: signature.clone()
            })
        );

        let old_peer = Contact::new(
            "9.9.9.9:6881".parse().unwrap(),
            PROTOCOL_VERSION_BLOCK_KEYS - 1,
        );
        assert_eq!(blocked_reply(&old_peer, request, signature, fallback.clone()), fallback);
    }
}
