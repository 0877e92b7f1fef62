use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::transport::rpc::Waiter;

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub transaction_id: u32,
    pub connection_id: u64,
    pub to: SocketAddr,
    pub sent_at: Instant,
    pub timeout: Duration,
    pub waiter: Waiter,
}

impl InflightRequest {
    pub fn does_match(&self, socket: &SocketAddr, tid: u32) -> bool {
        if self.transaction_id != tid {
            return false;
        }

        if self.to.port() != socket.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == socket.ip()
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.sent_at) >= self.timeout
    }
}

#[derive(Debug, Default)]
pub struct InflightRequests {
    requests: HashMap<u32, InflightRequest>,
    // Connection ids of every pending request, so new ids are never reused while outstanding.
    connection_ids: HashSet<u64>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: InflightRequest) {
        self.connection_ids.insert(request.connection_id);

        if let Some(replaced) = self.requests.insert(request.transaction_id, request) {
            // Only reachable if a caller picked a transaction id still inflight.
            self.connection_ids.remove(&replaced.connection_id);
        }
    }

    pub fn contains(&self, transaction_id: u32) -> bool {
        self.requests.contains_key(&transaction_id)
    }

    pub fn contains_connection_id(&self, connection_id: u64) -> bool {
        self.connection_ids.contains(&connection_id)
    }

    /// Remove inflight request by transaction_id if it exists and matches the address
    pub fn remove(&mut self, transaction_id: u32, from: &SocketAddr) -> Option<InflightRequest> {
        if !self
            .requests
            .get(&transaction_id)
            .is_some_and(|request| request.does_match(from, transaction_id))
        {
            return None;
        }

        self.remove_unchecked(transaction_id)
    }

    /// Remove a request regardless of where a reply came from, used when sending failed.
    pub fn remove_unchecked(&mut self, transaction_id: u32) -> Option<InflightRequest> {
        let request = self.requests.remove(&transaction_id)?;
        self.connection_ids.remove(&request.connection_id);

        Some(request)
    }

    /// Remove and return every request that has been waiting longer than its timeout.
    pub fn take_expired(&mut self) -> Vec<InflightRequest> {
        let now = Instant::now();

        let expired: Vec<u32> = self
            .requests
            .values()
            .filter(|request| request.is_expired(now))
            .map(|request| request.transaction_id)
            .collect();

        expired
            .into_iter()
            .filter_map(|tid| self.remove_unchecked(tid))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(tid: u32, connection_id: u64, to: &str, timeout: Duration) -> InflightRequest {
        let (sender, _) = flume::unbounded();

        InflightRequest {
            transaction_id: tid,
            connection_id,
            to: to.parse().unwrap(),
            sent_at: Instant::now(),
            timeout,
            waiter: Waiter::Probe(sender),
        }
    }

    #[test]
    fn remove_only_from_expected_address() {
        let mut inflight = InflightRequests::new();
        inflight.add(request(8, 1 << 63, "1.1.1.1:80", Duration::from_secs(5)));

        assert!(inflight
            .remove(8, &"1.1.1.1:81".parse().unwrap())
            .is_none());
        assert!(inflight.contains(8));
        assert!(inflight.contains_connection_id(1 << 63));

        assert!(inflight.remove(8, &"1.1.1.1:80".parse().unwrap()).is_some());
        assert!(!inflight.contains(8));
        assert!(!inflight.contains_connection_id(1 << 63));
    }

    #[test]
    fn expired_requests() {
        let mut inflight = InflightRequests::new();
        inflight.add(request(1, 1, "1.1.1.1:80", Duration::ZERO));
        inflight.add(request(2, 2, "1.1.1.1:80", Duration::from_secs(60)));

        let expired = inflight.take_expired();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].transaction_id, 1);
        assert!(inflight.contains(2));
        assert!(!inflight.contains_connection_id(1));
    }
}
