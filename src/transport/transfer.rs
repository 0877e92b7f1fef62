//! Chunked transfer of payloads larger than a single packet.
//!
//! A read sends a read request, and the responder streams read-reply chunks
//! of up to [MAX_DATA_SIZE] bytes. A write streams write-request chunks and
//! waits for a write reply acknowledging the whole payload. Either side
//! re-requests missing ranges of a partially received payload.

mod queue;
mod reassembly;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, info, trace};

use crate::common::{
    messages::wire::{DATA_HEADER_SIZE, HEADER_SIZE},
    Contact, DataPacket, DataPacketType, PacketBody, Request, RequestKind, MAX_DATA_SIZE,
    PACKET_MAX_BYTES,
};
use crate::{Error, Result};

use self::queue::{TransferQueue, TransferRegistry};
use self::reassembly::Reassembly;
use super::{listener::TransferListener, lock, read, write, Transport};

/// Size of the random keys correlating [Transport::write_read_transfer] calls.
pub const CALL_KEY_SIZE: usize = 20;

const COMPLETED_WRITES_MAX: usize = 64;

/// Serves reads and receives writes for one transfer key.
pub trait TransferHandler: Send + Sync {
    fn name(&self) -> &str;

    /// The payload stored under `key`, if any.
    fn handle_read(&self, originator: &Contact, key: &[u8]) -> Option<Bytes>;

    /// A complete payload written by `originator`, returning an optional
    /// reply payload to write back under the same key.
    fn handle_write(&self, originator: &Contact, key: &[u8], data: Bytes) -> Option<Bytes>;
}

pub(crate) struct Transfers {
    handlers: RwLock<HashMap<Bytes, Arc<dyn TransferHandler>>>,
    /// Our reads, and inbound writes being received.
    reads: Arc<TransferRegistry>,
    /// Our writes, receiving acknowledgements and re-requests.
    writes: Arc<TransferRegistry>,
    /// Pending [Transport::write_read_transfer] calls by call key.
    calls: Mutex<HashMap<Bytes, flume::Sender<Bytes>>>,
    /// Inbound writes already received, by connection id, with their total length.
    completed_writes: Mutex<LruCache<u64, u32>>,
}

impl std::fmt::Debug for Transfers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfers")
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .finish_non_exhaustive()
    }
}

impl Transfers {
    pub fn new(max_transfers: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            reads: TransferRegistry::new(max_transfers),
            writes: TransferRegistry::new(max_transfers),
            calls: Mutex::new(HashMap::new()),
            completed_writes: Mutex::new(LruCache::new(
                NonZeroUsize::new(COMPLETED_WRITES_MAX).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Returns true if a transfer in either direction uses this connection id.
    pub fn contains(&self, connection_id: u64) -> bool {
        self.reads.contains(connection_id) || self.writes.contains(connection_id)
    }
}

impl Transport {
    /// Register the handler serving transfers for `key`, replacing any previous one.
    pub fn register_transfer_handler(&self, key: &[u8], handler: Arc<dyn TransferHandler>) {
        info!(
            context = "transfer",
            name = handler.name(),
            key = ?key,
            "Transfer handler registered"
        );

        write(&self.0.transfers.handlers).insert(Bytes::copy_from_slice(key), handler);
    }

    /// Read the payload stored under `key` by the `handler_key` handler of `target`.
    pub fn read_transfer(
        &self,
        listener: &dyn TransferListener,
        target: &Contact,
        handler_key: &[u8],
        key: &[u8],
        timeout: Duration,
    ) -> Result<Bytes> {
        let queue = self
            .0
            .transfers
            .reads
            .register(self.new_connection_id())?;

        self.run_transfer_queue(
            &queue,
            listener,
            target,
            &Bytes::copy_from_slice(handler_key),
            &Bytes::copy_from_slice(key),
            timeout,
            None,
        )
    }

    /// Write `data` under `key` to the `handler_key` handler of `target`,
    /// returning once the whole payload is acknowledged.
    pub fn write_transfer(
        &self,
        listener: &dyn TransferListener,
        target: &Contact,
        handler_key: &[u8],
        key: &[u8],
        data: Bytes,
        timeout: Duration,
    ) -> Result<()> {
        let total_length =
            u32::try_from(data.len()).map_err(|_| Error::Encoding("transfer payload too large"))?;

        let connection_id = self.new_connection_id();
        let queue = self.0.transfers.writes.register(connection_id)?;

        let transfer_key = Bytes::copy_from_slice(handler_key);
        let request_key = Bytes::copy_from_slice(key);
        let resend_delay = self.0.config.write_resend_delay;

        let start = Instant::now();
        let mut last_packet_time: Option<Instant> = None;
        let mut reply_received = false;
        let mut sends = 0;

        loop {
            let elapsed = start.elapsed();
            if elapsed > timeout {
                listener.report_activity("send timeout");
                return Err(Error::TransferTimeout);
            }

            let mut since_last_packet = last_packet_time.map_or(resend_delay, |at| at.elapsed());

            if since_last_packet >= resend_delay {
                listener.report_activity(if sends == 0 { "sending" } else { "resending" });
                sends += 1;

                // Once the receiver answered, it only needs a nudge to re-request what it misses.
                self.send_range(
                    queue.connection_id(),
                    target,
                    DataPacketType::WriteRequest,
                    &transfer_key,
                    &request_key,
                    &data,
                    0,
                    0,
                    reply_received,
                );

                last_packet_time = Some(Instant::now());
                since_last_packet = Duration::ZERO;
            }

            let wait = (resend_delay - since_last_packet).min(timeout.saturating_sub(elapsed));
            let Some(packet) = queue.receive(wait) else {
                continue;
            };

            last_packet_time = Some(Instant::now());
            reply_received = true;

            match packet.packet_type {
                DataPacketType::WriteReply => {
                    if packet.start_position == 0 && packet.length == total_length {
                        listener.report_completeness(100);
                        listener.report_activity("send complete");
                        return Ok(());
                    }
                }
                DataPacketType::ReadRequest => {
                    listener.report_activity(&format!(
                        "resending {}-{}",
                        packet.start_position,
                        packet.end_position()
                    ));

                    self.send_range(
                        queue.connection_id(),
                        target,
                        DataPacketType::WriteRequest,
                        &transfer_key,
                        &request_key,
                        &data,
                        packet.start_position,
                        packet.length,
                        false,
                    );
                }
                packet_type => {
                    trace!(context = "transfer", ?packet_type, "Unexpected packet for a write");
                }
            }
        }
    }

    /// Write `data` to `target` under a random call key, and wait for the
    /// payload `target` writes back under the same key.
    pub fn write_read_transfer(
        &self,
        listener: &dyn TransferListener,
        target: &Contact,
        handler_key: &[u8],
        data: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        let call_key = Bytes::from(rand::random::<[u8; CALL_KEY_SIZE]>().to_vec());
        let (sender, receiver) = flume::bounded(1);

        lock(&self.0.transfers.calls).insert(call_key.clone(), sender);

        let result = self
            .write_transfer(listener, target, handler_key, &call_key, data, timeout)
            .and_then(|_| {
                receiver
                    .recv_timeout(timeout)
                    .map_err(|_| Error::TransferTimeout)
            });

        lock(&self.0.transfers.calls).remove(&call_key);

        result
    }

    /// Route an inbound data packet.
    pub(crate) fn handle_data(&self, originator: &Contact, connection_id: u64, packet: DataPacket) {
        let transfers = &self.0.transfers;

        match packet.packet_type {
            DataPacketType::ReadReply => {
                if !transfers.reads.deliver(connection_id, packet) {
                    trace!(context = "transfer", connection_id, "Read reply without a transfer");
                }
            }
            DataPacketType::WriteReply => {
                if !transfers.writes.deliver(connection_id, packet) {
                    trace!(context = "transfer", connection_id, "Write reply without a transfer");
                }
            }
            DataPacketType::ReadRequest => {
                // A receiver of our write asking for missing ranges.
                if !transfers.writes.deliver(connection_id, packet.clone()) {
                    self.serve_read(originator, connection_id, &packet);
                }
            }
            DataPacketType::WriteRequest => {
                if transfers.reads.deliver(connection_id, packet.clone()) {
                    return;
                }

                let completed = lock(&transfers.completed_writes).get(&connection_id).copied();
                if let Some(total_length) = completed {
                    // The writer missed our final acknowledgement.
                    self.send_write_reply(connection_id, originator, &packet, 0, total_length);
                    return;
                }

                self.start_inbound_write(originator.clone(), connection_id, packet);
            }
        }
    }

    // === Private Methods ===

    fn transfer_handler(&self, key: &[u8]) -> Option<Arc<dyn TransferHandler>> {
        read(&self.0.transfers.handlers).get(key).cloned()
    }

    fn serve_read(&self, originator: &Contact, connection_id: u64, request: &DataPacket) {
        let Some(handler) = self.transfer_handler(&request.transfer_key) else {
            debug!(
                context = "transfer",
                error = %Error::NoTransferHandler(request.transfer_key.to_vec()),
                "Ignoring read request"
            );
            return;
        };

        let Some(data) = handler.handle_read(originator, &request.request_key) else {
            return;
        };

        self.send_range(
            connection_id,
            originator,
            DataPacketType::ReadReply,
            &request.transfer_key,
            &request.request_key,
            &data,
            request.start_position,
            request.length,
            false,
        );
    }

    fn start_inbound_write(&self, originator: Contact, connection_id: u64, first: DataPacket) {
        let accepted = self.transfer_handler(&first.transfer_key).is_some()
            || lock(&self.0.transfers.calls).contains_key(&first.request_key);

        if !accepted {
            debug!(
                context = "transfer",
                error = %Error::NoTransferHandler(first.transfer_key.to_vec()),
                "Ignoring write request"
            );
            return;
        }

        let queue = match self.0.transfers.reads.register(connection_id) {
            Ok(queue) => queue,
            Err(error) => {
                debug!(context = "transfer", ?error, "Failed to create transfer queue");
                return;
            }
        };

        self.send_write_reply(
            connection_id,
            &originator,
            &first,
            first.start_position,
            first.data.len() as u32,
        );

        let transport = self.clone();
        let spawned = thread::Builder::new()
            .name("dht-udp-write".into())
            .spawn(move || transport.receive_write(queue, originator, first));

        if let Err(error) = spawned {
            debug!(context = "transfer", ?error, "Failed to spawn write processor");
        }
    }

    /// Receive the rest of an inbound write, then deliver it and write back any reply.
    fn receive_write(&self, queue: TransferQueue, originator: Contact, first: DataPacket) {
        let connection_id = queue.connection_id();
        let timeout = self.0.config.write_reply_timeout;

        let data = match self.run_transfer_queue(
            &queue,
            &(),
            &originator,
            &first.transfer_key,
            &first.request_key,
            timeout,
            Some(first.clone()),
        ) {
            Ok(data) => data,
            Err(error) => {
                debug!(
                    context = "transfer",
                    ?error,
                    %originator,
                    "Failed to process transfer queue"
                );
                return;
            }
        };

        if first.start_position != 0 || first.data.len() as u32 != first.total_length {
            self.send_write_reply(connection_id, &originator, &first, 0, first.total_length);
        }

        lock(&self.0.transfers.completed_writes).put(connection_id, first.total_length);
        drop(queue);

        let call = lock(&self.0.transfers.calls).remove(&first.request_key);
        let reply = match call {
            Some(call) => {
                let _ = call.send(data);
                None
            }
            None => self
                .transfer_handler(&first.transfer_key)
                .and_then(|handler| handler.handle_write(&originator, &first.request_key, data)),
        };

        if let Some(reply) = reply {
            if let Err(error) = self.write_transfer(
                &(),
                &originator,
                &first.transfer_key,
                &first.request_key,
                reply,
                timeout,
            ) {
                debug!(context = "transfer", ?error, %originator, "Failed to write reply");
            }
        }
    }

    /// Collect chunks from the queue until the payload is complete.
    ///
    /// Without a `first` packet this is a read, and the whole payload is
    /// requested up front. Otherwise it is the receiving end of a write.
    #[allow(clippy::too_many_arguments)]
    fn run_transfer_queue(
        &self,
        queue: &TransferQueue,
        listener: &dyn TransferListener,
        target: &Contact,
        transfer_key: &Bytes,
        request_key: &Bytes,
        timeout: Duration,
        first: Option<DataPacket>,
    ) -> Result<Bytes> {
        let connection_id = queue.connection_id();
        let rerequest_delay = self.0.config.read_rerequest_delay;

        let expected = if first.is_some() {
            DataPacketType::WriteRequest
        } else {
            DataPacketType::ReadReply
        };

        let mut reassembly = Reassembly::new();
        let mut entire_request_count = 1;
        let start = Instant::now();

        match first {
            Some(first) => {
                if let Some(payload) = add_chunk(&mut reassembly, listener, first) {
                    return Ok(payload);
                }
            }
            None => {
                listener.report_activity(&format!("requesting all from {target}"));
                self.send_read_request(connection_id, target, transfer_key, request_key, 0, 0);
            }
        }

        loop {
            let elapsed = start.elapsed();
            if elapsed > timeout {
                break;
            }

            match queue.receive(rerequest_delay.min(timeout - elapsed)) {
                Some(packet) if packet.packet_type == expected => {
                    if let Some(payload) = add_chunk(&mut reassembly, listener, packet) {
                        return Ok(payload);
                    }
                }
                Some(packet) => {
                    trace!(
                        context = "transfer",
                        packet_type = ?packet.packet_type,
                        "Unexpected packet in transfer queue"
                    );
                }
                None if reassembly.is_empty() => {
                    if entire_request_count == 2 {
                        listener.report_activity(&format!("timeout, no reply from {target}"));
                        return Err(Error::TransferTimeout);
                    }

                    entire_request_count += 1;
                    listener.report_activity(&format!("re-requesting all from {target}"));
                    self.send_read_request(connection_id, target, transfer_key, request_key, 0, 0);
                }
                None => {
                    for (gap_start, gap_length) in reassembly.gaps() {
                        listener.report_activity(&format!(
                            "re-requesting {}-{} from {target}",
                            gap_start,
                            gap_start + gap_length
                        ));

                        self.send_read_request(
                            connection_id,
                            target,
                            transfer_key,
                            request_key,
                            gap_start,
                            gap_length,
                        );
                    }
                }
            }
        }

        listener.report_activity(&format!("timeout, {} bytes received", reassembly.transferred()));

        Err(Error::TransferTimeout)
    }

    /// Send `length` bytes of `data` from `start` (the rest of it if `length` is 0) in chunks.
    #[allow(clippy::too_many_arguments)]
    fn send_range(
        &self,
        connection_id: u64,
        target: &Contact,
        packet_type: DataPacketType,
        transfer_key: &Bytes,
        request_key: &Bytes,
        data: &Bytes,
        start: u32,
        length: u32,
        first_packet_only: bool,
    ) {
        let total_length = data.len() as u32;

        if data.is_empty() {
            self.send_data(
                connection_id,
                target,
                DataPacket {
                    packet_type,
                    transfer_key: transfer_key.clone(),
                    request_key: request_key.clone(),
                    data: Bytes::new(),
                    start_position: 0,
                    length: 0,
                    total_length: 0,
                },
            );
            return;
        }

        if start >= total_length {
            debug!(context = "transfer", start, total_length, "Invalid start position");
            return;
        }

        let length = if length == 0 { total_length - start } else { length };
        let Some(end) = start.checked_add(length).filter(|end| *end <= total_length) else {
            debug!(context = "transfer", start, length, total_length, "Invalid length");
            return;
        };

        let max_chunk = max_chunk_size(transfer_key, request_key);

        let mut position = start;
        while position < end {
            let chunk = (end - position).min(max_chunk);

            self.send_data(
                connection_id,
                target,
                DataPacket {
                    packet_type,
                    transfer_key: transfer_key.clone(),
                    request_key: request_key.clone(),
                    data: data.slice(position as usize..(position + chunk) as usize),
                    start_position: position,
                    length: chunk,
                    total_length,
                },
            );

            if first_packet_only {
                break;
            }
            position += chunk;
        }
    }

    fn send_read_request(
        &self,
        connection_id: u64,
        target: &Contact,
        transfer_key: &Bytes,
        request_key: &Bytes,
        start: u32,
        length: u32,
    ) {
        self.send_data(
            connection_id,
            target,
            DataPacket {
                packet_type: DataPacketType::ReadRequest,
                transfer_key: transfer_key.clone(),
                request_key: request_key.clone(),
                data: Bytes::new(),
                start_position: start,
                length,
                total_length: 0,
            },
        );
    }

    fn send_write_reply(
        &self,
        connection_id: u64,
        target: &Contact,
        request: &DataPacket,
        start: u32,
        length: u32,
    ) {
        self.send_data(
            connection_id,
            target,
            DataPacket {
                packet_type: DataPacketType::WriteReply,
                transfer_key: request.transfer_key.clone(),
                request_key: request.request_key.clone(),
                data: Bytes::new(),
                start_position: start,
                length,
                total_length: 0,
            },
        );
    }

    /// Data packets are fire and forget, losses are recovered by re-requests.
    fn send_data(&self, connection_id: u64, target: &Contact, data: DataPacket) {
        let result = self.check_address(target).and_then(|_| {
            let packet = self.packet(
                connection_id,
                self.0.socket.tid(),
                target.transport_address(),
                PacketBody::Request(Request::Data(data)),
            );

            self.0.socket.send(target.transport_address(), &packet)
        });

        match result {
            Ok(size) => {
                self.0.counters.packet_sent(size);
                self.0.counters.request_sent(RequestKind::Data);
            }
            Err(error) => {
                trace!(context = "transfer", ?error, %target, "Failed to send data packet");
            }
        }
    }
}

/// Chunks never exceed [MAX_DATA_SIZE], and shrink so that long keys still fit a packet.
fn max_chunk_size(transfer_key: &[u8], request_key: &[u8]) -> u32 {
    let overhead = HEADER_SIZE + DATA_HEADER_SIZE + transfer_key.len() + request_key.len();

    PACKET_MAX_BYTES
        .saturating_sub(overhead)
        .clamp(1, MAX_DATA_SIZE) as u32
}

fn add_chunk(
    reassembly: &mut Reassembly,
    listener: &dyn TransferListener,
    packet: DataPacket,
) -> Option<Bytes> {
    let first = reassembly.total_length().is_none();
    let start = packet.start_position;
    let end = start.saturating_add(packet.data.len() as u32);

    if !reassembly.add(start, packet.data, packet.total_length) {
        return None;
    }

    if first {
        listener.report_size(packet.total_length as u64);
    }
    listener.report_activity(&format!("received {start}-{end}"));
    listener.report_completeness(reassembly.completeness());

    let payload = reassembly.assemble()?;
    listener.report_activity("complete");

    Some(payload)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{Packet, PROTOCOL_VERSION};

    fn data_packet(transfer_key: Bytes, request_key: Bytes) -> Packet {
        let size = max_chunk_size(&transfer_key, &request_key) as usize;

        Packet {
            version: PROTOCOL_VERSION,
            connection_id: 1 << 63,
            transaction_id: u32::MAX,
            sender: "[2001:db8::1]:6881".parse().unwrap(),
            sender_instance_id: 1,
            receiver: "[2001:db8::2]:6881".parse().unwrap(),
            body: PacketBody::Request(Request::Data(DataPacket {
                packet_type: DataPacketType::ReadReply,
                transfer_key,
                request_key,
                data: Bytes::from(vec![0; size]),
                start_position: 0,
                length: size as u32,
                total_length: u32::MAX,
            })),
        }
    }

    #[test]
    fn short_keys_use_full_chunks() {
        assert_eq!(max_chunk_size(b"files", &[0; CALL_KEY_SIZE]), MAX_DATA_SIZE as u32);
    }

    #[test]
    fn chunks_fit_a_packet_with_longest_keys() {
        let longest = Bytes::from(vec![7; u8::MAX as usize]);
        let packet = data_packet(longest.clone(), longest);

        assert!(max_chunk_size(&[0; 255], &[0; 255]) < MAX_DATA_SIZE as u32);
        assert_eq!(packet.to_bytes().unwrap().len(), PACKET_MAX_BYTES);
    }
}
