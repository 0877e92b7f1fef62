//! Per connection queues of data packets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use tracing::trace;

use crate::common::DataPacket;
use crate::{Error, Result};

use crate::transport::lock;

/// Packets buffered per transfer before new ones are dropped.
const QUEUE_CAPACITY: usize = 512;

/// Registry of the transfer queues of one direction, by connection id.
#[derive(Debug)]
pub(crate) struct TransferRegistry {
    queues: Mutex<HashMap<u64, Sender<DataPacket>>>,
    max_transfers: usize,
}

impl TransferRegistry {
    pub fn new(max_transfers: usize) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            max_transfers,
        })
    }

    /// Register a queue for `connection_id`.
    ///
    /// Fails with [Error::DuplicateTransfer] if `connection_id` already has a queue,
    /// and with [Error::TransferQueueLimit] once `max_transfers` queues are registered.
    pub fn register(self: &Arc<Self>, connection_id: u64) -> Result<TransferQueue> {
        let (sender, receiver) = flume::bounded(QUEUE_CAPACITY);

        let mut queues = lock(&self.queues);
        if queues.contains_key(&connection_id) {
            return Err(Error::DuplicateTransfer(connection_id));
        }
        if queues.len() >= self.max_transfers {
            return Err(Error::TransferQueueLimit);
        }
        queues.insert(connection_id, sender);

        Ok(TransferQueue {
            connection_id,
            receiver,
            registry: self.clone(),
        })
    }

    /// Deliver a packet to the queue of its connection, returns false if there is none.
    pub fn deliver(&self, connection_id: u64, packet: DataPacket) -> bool {
        let queues = lock(&self.queues);
        let Some(sender) = queues.get(&connection_id) else {
            return false;
        };

        if let Err(TrySendError::Full(_)) = sender.try_send(packet) {
            trace!(context = "transfer_queue", connection_id, "Queue full, dropping packet");
        }

        true
    }

    pub fn contains(&self, connection_id: u64) -> bool {
        lock(&self.queues).contains_key(&connection_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.queues).len()
    }

    fn unregister(&self, connection_id: u64) {
        lock(&self.queues).remove(&connection_id);
    }
}

/// A registered queue, unregistered when dropped.
#[derive(Debug)]
pub(crate) struct TransferQueue {
    connection_id: u64,
    receiver: Receiver<DataPacket>,
    registry: Arc<TransferRegistry>,
}

impl TransferQueue {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Wait up to `timeout` for the next packet.
    pub fn receive(&self, timeout: Duration) -> Option<DataPacket> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        self.registry.unregister(self.connection_id);
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::common::DataPacketType;

    fn packet(start: u32) -> DataPacket {
        DataPacket {
            packet_type: DataPacketType::ReadReply,
            transfer_key: Bytes::from_static(b"t"),
            request_key: Bytes::from_static(b"k"),
            data: Bytes::from_static(b"x"),
            start_position: start,
            length: 1,
            total_length: 10,
        }
    }

    #[test]
    fn limit_exceeded() {
        let registry = TransferRegistry::new(3);

        let queues: Vec<TransferQueue> = (0..3).map(|id| registry.register(id).unwrap()).collect();

        assert_eq!(registry.register(3).unwrap_err(), Error::TransferQueueLimit);

        // Existing queues remain usable.
        for queue in &queues {
            assert!(registry.deliver(queue.connection_id(), packet(queue.connection_id() as u32)));
            assert_eq!(
                queue.receive(Duration::from_millis(10)),
                Some(packet(queue.connection_id() as u32))
            );
        }

        drop(queues);
        assert!(registry.register(3).is_ok());
    }

    #[test]
    fn duplicate_connection_id_rejected() {
        let registry = TransferRegistry::new(4);
        let queue = registry.register(7).unwrap();

        assert_eq!(registry.register(7).unwrap_err(), Error::DuplicateTransfer(7));
        assert_eq!(registry.len(), 1);

        // The first queue still receives its packets.
        assert!(registry.deliver(7, packet(3)));
        assert_eq!(queue.receive(Duration::from_millis(10)), Some(packet(3)));
    }

    #[test]
    fn nothing_delivered_after_drop() {
        let registry = TransferRegistry::new(1);
        let queue = registry.register(7).unwrap();

        assert!(registry.contains(7));
        drop(queue);

        assert!(!registry.contains(7));
        assert_eq!(registry.len(), 0);
        assert!(!registry.deliver(7, packet(0)));
    }
}
