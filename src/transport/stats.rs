//! Traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::RequestKind;

const KINDS: usize = RequestKind::ALL.len();

#[derive(Debug, Default)]
struct KindCounters {
    sent: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    received: AtomicU64,
    alien: AtomicU64,
}

/// Lock-free counters updated from every thread of the transport.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    requests: [KindCounters; KINDS],
}

impl Counters {
    pub fn packet_sent(&self, size: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self, size: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn request_sent(&self, kind: RequestKind) {
        self.requests[kind.index()]
            .sent
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_ok(&self, kind: RequestKind) {
        self.requests[kind.index()].ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self, kind: RequestKind) {
        self.requests[kind.index()]
            .failed
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count an inbound request, `alien` if its sender wasn't in the contact history.
    pub fn request_received(&self, kind: RequestKind, alien: bool) {
        let counters = &self.requests[kind.index()];

        counters.received.fetch_add(1, Ordering::Relaxed);
        if alien {
            counters.alien.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TransportStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let mut requests = [RequestCounts::default(); KINDS];
        for (counts, counters) in requests.iter_mut().zip(self.requests.iter()) {
            *counts = RequestCounts {
                sent: load(&counters.sent),
                ok: load(&counters.ok),
                failed: load(&counters.failed),
                received: load(&counters.received),
                alien: load(&counters.alien),
            };
        }

        TransportStats {
            packets_sent: load(&self.packets_sent),
            packets_received: load(&self.packets_received),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            requests,
        }
    }
}

/// Counts for one [RequestKind].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    /// Requests sent by this node.
    pub sent: u64,
    /// Sent requests that got a successful reply.
    pub ok: u64,
    /// Sent requests that failed or timed out.
    pub failed: u64,
    /// Requests received from other nodes.
    pub received: u64,
    /// Received requests from senders this node never contacted.
    pub alien: u64,
}

/// A snapshot of the transport's traffic counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    requests: [RequestCounts; KINDS],
}

impl TransportStats {
    pub fn requests(&self, kind: RequestKind) -> RequestCounts {
        self.requests[kind.index()]
    }

    pub fn incoming_requests(&self) -> u64 {
        self.requests.iter().map(|counts| counts.received).sum()
    }

    /// Alien requests of every kind.
    pub fn aliens(&self) -> u64 {
        self.requests.iter().map(|counts| counts.alien).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot() {
        let counters = Counters::default();

        counters.request_sent(RequestKind::Ping);
        counters.request_ok(RequestKind::Ping);
        counters.request_received(RequestKind::FindValue, true);
        counters.request_received(RequestKind::FindValue, false);
        counters.request_received(RequestKind::Store, true);
        counters.packet_sent(100);

        let stats = counters.snapshot();

        assert_eq!(stats.requests(RequestKind::Ping).sent, 1);
        assert_eq!(stats.requests(RequestKind::Ping).ok, 1);
        assert_eq!(stats.requests(RequestKind::FindValue).received, 2);
        assert_eq!(stats.requests(RequestKind::FindValue).alien, 1);
        assert_eq!(stats.incoming_requests(), 3);
        assert_eq!(stats.aliens(), 2);
        assert_eq!(stats.bytes_sent, 100);
    }
}
