//! Outgoing requests and the handling of their replies.

use std::mem;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use flume::TrySendError;
use tracing::{debug, trace};

use crate::common::{
    messages::wire::{value_len, HEADER_SIZE},
    Contact, ErrorReply, FindNodeRequest, FindValueReply, FindValueRequest, KeyBlockRequest,
    NodeStats, NodeStatus, Packet, PacketBody, Reply, Request, RequestKind, StatsRequest,
    StoreRequest, StoredValue, PACKET_MAX_BYTES, PROTOCOL_VERSION_XFER_STATUS,
    STATS_TYPE_ORIGINAL,
};
use crate::{Error, Result};

use super::socket::inflight_requests::InflightRequest;
use super::{read, Transport};

/// Room left for keys and values in a store request, after the header,
/// the random id and the key count.
const STORE_BODY_MAX_BYTES: usize = PACKET_MAX_BYTES - HEADER_SIZE - 4 - 1;

/// Sender half of the channel [RpcOutcome]s are delivered to.
///
/// Outcomes never block the transport, they are dropped while a bounded channel is full.
pub type ReplySender = flume::Sender<RpcOutcome>;

/// The outcome of a request sent to `contact`.
#[derive(Debug, Clone)]
pub struct RpcOutcome {
    /// The contact the request was sent to, updated from its reply.
    pub contact: Contact,
    pub result: Result<Response>,
}

/// A successful reply to a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ping,
    FindNode {
        contacts: Vec<Contact>,
        /// Echoed back on store and key-block requests to this contact.
        random_id: u32,
        node_status: NodeStatus,
        estimated_dht_size: u32,
    },
    /// One part of a find-value reply, more parts follow while
    /// [FindValueReply::Values::continuation] is set.
    FindValue(FindValueReply),
    Store {
        diversifications: Vec<u8>,
    },
    KeyBlock,
    Stats(NodeStats),
}

/// Whoever waits for the reply of an inflight request.
#[derive(Debug, Clone)]
pub(crate) enum Waiter {
    Rpc {
        kind: RequestKind,
        contact: Contact,
        sender: ReplySender,
        /// Only the first packet of a split request reports its outcome.
        report: bool,
    },
    /// External address probe, answered with the address the contact sees us at.
    Probe(flume::Sender<Option<SocketAddr>>),
}

impl Transport {
    // === Requests ===

    pub fn send_ping(&self, contact: &Contact, sender: &ReplySender) {
        self.send_rpc(contact, Request::Ping, sender, self.0.config.request_timeout, true);
    }

    pub fn send_find_node(&self, contact: &Contact, sender: &ReplySender, target: &[u8]) {
        let request = Request::FindNode(FindNodeRequest {
            target: Bytes::copy_from_slice(target),
        });

        self.send_rpc(contact, request, sender, self.0.config.request_timeout, true);
    }

    pub fn send_find_value(
        &self,
        contact: &Contact,
        sender: &ReplySender,
        key: &[u8],
        max_values: u8,
        flags: u8,
    ) {
        let request = Request::FindValue(FindValueRequest {
            key: Bytes::copy_from_slice(key),
            max_values,
            flags,
        });

        self.send_rpc(contact, request, sender, self.0.config.request_timeout, true);
    }

    /// Store one set of values per key, split over as many packets as needed.
    ///
    /// Only the outcome of the first packet is reported.
    pub fn send_store(
        &self,
        contact: &Contact,
        sender: &ReplySender,
        keys: Vec<Bytes>,
        value_sets: Vec<Vec<StoredValue>>,
    ) {
        if keys.len() != value_sets.len() {
            self.0.counters.request_sent(RequestKind::Store);
            self.0.counters.request_failed(RequestKind::Store);

            let _ = sender.send(RpcOutcome {
                contact: contact.clone(),
                result: Err(Error::Encoding("store keys and value sets differ in length")),
            });
            return;
        }

        let timeout = self.0.config.request_timeout * 2;

        for (i, (keys, value_sets)) in split_store(keys, value_sets).into_iter().enumerate() {
            let request = Request::Store(StoreRequest {
                random_id: contact.random_id(),
                keys,
                value_sets,
            });

            self.send_rpc(contact, request, sender, timeout, i == 0);
        }
    }

    pub fn send_key_block(
        &self,
        contact: &Contact,
        sender: &ReplySender,
        request: Bytes,
        signature: Bytes,
    ) {
        let request = Request::KeyBlock(KeyBlockRequest {
            random_id: contact.random_id(),
            request,
            signature,
        });

        self.send_rpc(contact, request, sender, self.0.config.request_timeout, true);
    }

    pub fn send_stats(&self, contact: &Contact, sender: &ReplySender) {
        let request = Request::Stats(StatsRequest {
            stats_type: STATS_TYPE_ORIGINAL,
        });

        self.send_rpc(contact, request, sender, self.0.config.request_timeout, true);
    }

    // === Crate Methods ===

    /// Send a request to `contact` under a fresh connection id, and keep it
    /// inflight until `waiter` gets a reply or a timeout.
    pub(crate) fn request(
        &self,
        contact: &Contact,
        request: Request,
        waiter: Waiter,
        timeout: Duration,
    ) -> Result<u64> {
        self.check_address(contact)?;

        let connection_id = self.new_connection_id();
        let to = contact.transport_address();
        let packet = self.packet(
            connection_id,
            self.0.socket.tid(),
            to,
            PacketBody::Request(request),
        );

        let size = self.0.socket.request(to, &packet, waiter, timeout)?;
        self.0.counters.packet_sent(size);

        Ok(connection_id)
    }

    /// A packet with the local contact's addressing.
    pub(crate) fn packet(
        &self,
        connection_id: u64,
        transaction_id: u32,
        receiver: SocketAddr,
        body: PacketBody,
    ) -> Packet {
        let local_contact = read(&self.0.local_contact);

        Packet {
            version: self.0.config.protocol_version,
            connection_id,
            transaction_id,
            sender: local_contact.external_address(),
            sender_instance_id: local_contact.instance_id(),
            receiver,
            body,
        }
    }

    pub(crate) fn handle_reply(&self, packet: Packet, from: SocketAddr) {
        let PacketBody::Reply(reply) = packet.body else {
            return;
        };

        let Some(inflight) = self.0.socket.take_inflight(packet.transaction_id, &from) else {
            return;
        };

        match inflight.waiter.clone() {
            Waiter::Probe(sender) => {
                let address = match reply {
                    _ if packet.connection_id != inflight.connection_id => None,
                    Reply::Ping => Some(packet.receiver),
                    Reply::Error(ErrorReply::OriginatorAddressWrong(address)) => Some(address),
                    _ => None,
                };

                let _ = sender.send(address);
            }
            Waiter::Rpc {
                kind,
                mut contact,
                sender,
                report,
            } => {
                let result = if packet.connection_id != inflight.connection_id {
                    debug!(
                        context = "rpc",
                        expected = inflight.connection_id,
                        received = packet.connection_id,
                        %contact,
                        "Connection id mismatch"
                    );

                    Err(Error::CorrelationMismatch {
                        expected: inflight.connection_id,
                        received: packet.connection_id,
                    })
                } else {
                    contact.set_instance_id_and_version(packet.sender_instance_id, packet.version);
                    self.process_reply(kind, &mut contact, reply)
                };

                if let Ok(Response::FindValue(FindValueReply::Values {
                    continuation: true,
                    ..
                })) = result
                {
                    self.0.socket.keep_inflight(inflight);
                }

                if report {
                    self.report(kind, contact, &sender, result);
                }
            }
        }
    }

    pub(crate) fn request_timed_out(&self, request: InflightRequest) {
        match request.waiter {
            Waiter::Probe(sender) => {
                let _ = sender.send(None);
            }
            Waiter::Rpc {
                kind,
                contact,
                sender,
                report,
            } => {
                trace!(context = "rpc", kind = kind.name(), %contact, "Request timed out");

                if report {
                    self.report(kind, contact, &sender, Err(Error::Timeout));
                }
            }
        }
    }

    // === Private Methods ===

    fn send_rpc(
        &self,
        contact: &Contact,
        request: Request,
        sender: &ReplySender,
        timeout: Duration,
        report: bool,
    ) {
        let kind = request.kind();

        if report {
            self.0.counters.request_sent(kind);
        }

        let waiter = Waiter::Rpc {
            kind,
            contact: contact.clone(),
            sender: sender.clone(),
            report,
        };

        if let Err(error) = self.request(contact, request, waiter, timeout) {
            debug!(context = "rpc", ?error, kind = kind.name(), %contact, "Failed to send request");

            if report {
                self.report(kind, contact.clone(), sender, Err(error));
            }
        }
    }

    /// Count and deliver an outcome without blocking, this runs on the IO thread.
    fn report(
        &self,
        kind: RequestKind,
        contact: Contact,
        sender: &ReplySender,
        result: Result<Response>,
    ) {
        match result {
            Ok(_) => self.0.counters.request_ok(kind),
            Err(_) => self.0.counters.request_failed(kind),
        }

        if let Err(TrySendError::Full(outcome)) = sender.try_send(RpcOutcome { contact, result }) {
            debug!(
                context = "rpc",
                kind = kind.name(),
                contact = %outcome.contact,
                "Reply channel full, dropping outcome"
            );
        }
    }

    fn process_reply(
        &self,
        kind: RequestKind,
        contact: &mut Contact,
        reply: Reply,
    ) -> Result<Response> {
        let response = match (kind, reply) {
            (_, Reply::Error(ErrorReply::OriginatorAddressWrong(address))) => {
                self.address_disputed(contact, address);

                return Err(Error::AddressDisputed(address));
            }
            (_, Reply::Error(ErrorReply::KeyBlocked { request, signature })) => {
                self.0.contacts.contact_alive(contact);

                return Err(Error::KeyBlocked { request, signature });
            }
            (RequestKind::Ping, Reply::Ping) => Response::Ping,
            (RequestKind::FindNode, Reply::FindNode(reply)) => {
                contact.set_random_id(reply.random_id);
                if contact.protocol_version() >= PROTOCOL_VERSION_XFER_STATUS {
                    contact.set_node_status(reply.node_status);
                }
                self.0.contacts.update_contact_status(contact, reply.node_status);

                if let Some(handler) = self.request_handler() {
                    handler.set_estimated_dht_size(reply.estimated_dht_size);
                }

                Response::FindNode {
                    contacts: reply.contacts,
                    random_id: reply.random_id,
                    node_status: reply.node_status,
                    estimated_dht_size: reply.estimated_dht_size,
                }
            }
            (RequestKind::FindValue, Reply::FindValue(reply)) => Response::FindValue(reply),
            (RequestKind::Store, Reply::Store(reply)) => Response::Store {
                diversifications: reply.diversifications,
            },
            (RequestKind::KeyBlock, Reply::KeyBlock) => Response::KeyBlock,
            (RequestKind::Stats, Reply::Stats(stats)) => Response::Stats(stats),
            (_, reply) => return Err(Error::UnexpectedReply(reply.name())),
        };

        self.0.contacts.contact_alive(contact);

        Ok(response)
    }
}

/// Split keys and their values into store requests fitting [PACKET_MAX_BYTES].
///
/// A key whose values don't fit a single packet is repeated in the next one.
fn split_store(
    keys: Vec<Bytes>,
    value_sets: Vec<Vec<StoredValue>>,
) -> Vec<(Vec<Bytes>, Vec<Vec<StoredValue>>)> {
    let mut packets = vec![];

    let mut current_keys: Vec<Bytes> = vec![];
    let mut current_sets: Vec<Vec<StoredValue>> = vec![];
    let mut size = 0;

    for (key, values) in keys.into_iter().zip(value_sets) {
        let key_size = 1 + key.len() + 1;

        if !current_keys.is_empty()
            && (size + key_size > STORE_BODY_MAX_BYTES || current_keys.len() == u8::MAX as usize)
        {
            packets.push((mem::take(&mut current_keys), mem::take(&mut current_sets)));
            size = 0;
        }

        current_keys.push(key.clone());
        current_sets.push(vec![]);
        size += key_size;

        for value in values {
            let length = value_len(&value);
            let held = current_sets.last().map_or(0, Vec::len);

            if held > 0 && (size + length > STORE_BODY_MAX_BYTES || held == u8::MAX as usize) {
                packets.push((mem::take(&mut current_keys), mem::take(&mut current_sets)));

                current_keys.push(key.clone());
                current_sets.push(vec![]);
                size = key_size;
            }

            if let Some(set) = current_sets.last_mut() {
                set.push(value);
            }
            size += length;
        }
    }

    if !current_keys.is_empty() || packets.is_empty() {
        packets.push((current_keys, current_sets));
    }

    packets
}

#[cfg(test)]
mod test {
    use super::*;

    fn value(size: usize) -> StoredValue {
        StoredValue {
            version: 1,
            created: 0,
            value: Bytes::from(vec![7; size]),
            originator: Contact::new("1.2.3.4:5000".parse().unwrap(), 16),
            flags: 0,
        }
    }

    #[test]
    fn small_store_fits_one_packet() {
        let packets = split_store(
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            vec![vec![value(10)], vec![value(10), value(10)]],
        );

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0.len(), 2);
        assert_eq!(packets[0].1[1].len(), 2);
    }

    #[test]
    fn large_values_split_with_repeated_key() {
        let packets = split_store(
            vec![Bytes::from_static(b"key")],
            vec![(0..4).map(|_| value(500)).collect()],
        );

        assert!(packets.len() > 1);
        for (keys, sets) in &packets {
            assert_eq!(keys, &vec![Bytes::from_static(b"key")]);

            let size: usize = 1 + 3 + 1 + sets[0].iter().map(value_len).sum::<usize>();
            assert!(size <= STORE_BODY_MAX_BYTES);
        }

        let total: usize = packets.iter().map(|(_, sets)| sets[0].len()).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn empty_store_is_one_packet() {
        let packets = split_store(vec![], vec![]);

        assert_eq!(packets, vec![(vec![], vec![])]);
    }
}
