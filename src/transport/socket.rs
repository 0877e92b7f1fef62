//! UDP socket layer correlating outgoing requests with their replies.

pub mod inflight_requests;
pub mod udp;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::trace;

use crate::common::{Packet, PACKET_MAX_BYTES};
use crate::Result;

use self::inflight_requests::{InflightRequest, InflightRequests};
use self::udp::Udp;
use super::{config::DEFAULT_PORT, lock};

/// Larger datagrams are truncated, and fail to decode.
const MTU: usize = PACKET_MAX_BYTES;

/// The maximum duration to backoff checking the [Udp] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A [Udp] wrapper that encodes packets and tracks inflight requests.
#[derive(Debug)]
pub(crate) struct DhtSocket {
    socket: Box<dyn Udp>,
    local_addr: SocketAddr,
    next_tid: AtomicU32,
    inflight_requests: Mutex<InflightRequests>,
}

impl DhtSocket {
    pub(crate) fn new(socket: Option<Box<dyn Udp>>, port: Option<u16>) -> Result<Self> {
        let socket: Box<dyn Udp> = match (socket, port) {
            (Some(socket), _) => socket,
            (None, Some(port)) => udp::real::UdpSocket::bind(bind_address(port))?,
            (None, None) => match udp::real::UdpSocket::bind(bind_address(DEFAULT_PORT)) {
                Ok(socket) => socket,
                Err(_) => udp::real::UdpSocket::bind(bind_address(0))?,
            },
        };

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            next_tid: AtomicU32::new(0),
            inflight_requests: Mutex::new(InflightRequests::new()),
        })
    }

    // === Getters ===

    /// Returns the address the socket is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns true if this transaction_id is still inflight
    pub fn inflight(&self, transaction_id: u32) -> bool {
        lock(&self.inflight_requests).contains(transaction_id)
    }

    pub fn is_connection_id_inflight(&self, connection_id: u64) -> bool {
        lock(&self.inflight_requests).contains_connection_id(connection_id)
    }

    // === Public Methods ===

    /// Next transaction id, wrapping around and skipping ids still inflight.
    pub fn tid(&self) -> u32 {
        let inflight_requests = lock(&self.inflight_requests);

        loop {
            let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);

            if !inflight_requests.contains(tid) {
                return tid;
            }
        }
    }

    /// Send a request and keep it inflight until a reply or a timeout, returns the encoded size.
    pub fn request(
        &self,
        to: SocketAddr,
        packet: &Packet,
        waiter: super::rpc::Waiter,
        timeout: Duration,
    ) -> Result<usize> {
        let bytes = packet.to_bytes()?;

        lock(&self.inflight_requests).add(InflightRequest {
            transaction_id: packet.transaction_id,
            connection_id: packet.connection_id,
            to,
            sent_at: std::time::Instant::now(),
            timeout,
            waiter,
        });

        trace!(context = "socket_message_sending", ?packet, ?to);

        if let Err(error) = self.socket.send_to(&bytes, to) {
            lock(&self.inflight_requests).remove_unchecked(packet.transaction_id);
            return Err(error.into());
        }

        Ok(bytes.len())
    }

    /// Send a reply, or a request that expects no reply (data packets).
    pub fn send(&self, to: SocketAddr, packet: &Packet) -> Result<usize> {
        let bytes = packet.to_bytes()?;

        trace!(context = "socket_message_sending", ?packet, ?to);

        Ok(self.socket.send_to(&bytes, to)?)
    }

    /// Receives a single packet on the socket.
    /// On success, returns the decoded packet, its size and the origin.
    pub fn recv_from(&self) -> Option<(Packet, usize, SocketAddr)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, from)) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Packet from port 0"
                    );
                    return None;
                }

                match Packet::from_bytes(bytes) {
                    Ok(packet) => {
                        trace!(context = "socket_message_receiving", ?packet, ?from);
                        return Some((packet, amt, from));
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            size = amt,
                            "Received invalid packet."
                        );
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                trace!(
                    context = "socket_error",
                    ?e,
                    "recv_from failed unexpectedly"
                );
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
        }

        None
    }

    /// Take the inflight request a reply answers, if it came from the right address.
    pub fn take_inflight(&self, transaction_id: u32, from: &SocketAddr) -> Option<InflightRequest> {
        let request = lock(&self.inflight_requests).remove(transaction_id, from);

        if request.is_none() {
            trace!(
                context = "socket_validation",
                transaction_id,
                ?from,
                message = "Unexpected reply"
            );
        }

        request
    }

    /// Put back a request that expects more replies.
    pub fn keep_inflight(&self, mut request: InflightRequest) {
        request.sent_at = std::time::Instant::now();
        lock(&self.inflight_requests).add(request);
    }

    pub fn take_expired(&self) -> Vec<InflightRequest> {
        lock(&self.inflight_requests).take_expired()
    }
}

fn bind_address(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;
    use crate::common::{PacketBody, Reply, Request, PROTOCOL_VERSION};
    use crate::transport::rpc::Waiter;

    fn sim_socket() -> DhtSocket {
        DhtSocket::new(Some(udp::sim::UdpSocket::bind().unwrap()), None).unwrap()
    }

    fn packet(from: &DhtSocket, to: &DhtSocket, tid: u32, body: PacketBody) -> Packet {
        Packet {
            version: PROTOCOL_VERSION,
            connection_id: 1 << 63,
            transaction_id: tid,
            sender: from.local_addr(),
            sender_instance_id: 1,
            receiver: to.local_addr(),
            body,
        }
    }

    fn recv(socket: &DhtSocket) -> (Packet, SocketAddr) {
        let start = Instant::now();
        loop {
            if let Some((packet, _, from)) = socket.recv_from() {
                return (packet, from);
            }
            assert!(start.elapsed() < Duration::from_secs(1), "no packet received");
        }
    }

    #[test]
    fn tid() {
        let socket = sim_socket();

        assert_eq!(socket.tid(), 0);
        assert_eq!(socket.tid(), 1);

        socket.next_tid.store(u32::MAX, Ordering::Relaxed);

        assert_eq!(socket.tid(), u32::MAX);
        assert_eq!(socket.tid(), 0);
    }

    #[test]
    fn tid_skips_inflight_requests() {
        let client = sim_socket();
        let server = sim_socket();
        let (sender, _receiver) = flume::unbounded();

        let request = packet(&client, &server, 5, PacketBody::Request(Request::Ping));
        client
            .request(
                server.local_addr(),
                &request,
                Waiter::Probe(sender),
                Duration::from_secs(5),
            )
            .unwrap();

        client.next_tid.store(5, Ordering::Relaxed);

        assert_eq!(client.tid(), 6);
        assert!(client.inflight(5));
    }

    #[test]
    fn request_and_reply() {
        let client = sim_socket();
        let server = sim_socket();
        let (sender, _receiver) = flume::unbounded();

        let request = packet(&client, &server, 120, PacketBody::Request(Request::Ping));
        client
            .request(
                server.local_addr(),
                &request,
                Waiter::Probe(sender),
                Duration::from_secs(5),
            )
            .unwrap();
        assert!(client.inflight(120));
        assert!(client.is_connection_id_inflight(1 << 63));

        let (received, from) = recv(&server);
        assert_eq!(received, request);
        assert_eq!(from, client.local_addr());

        let reply = packet(&server, &client, 120, PacketBody::Reply(Reply::Ping));
        server.send(from, &reply).unwrap();

        let (received, from) = recv(&client);
        assert_eq!(received, reply);

        assert!(client.take_inflight(120, &from).is_some());
        assert!(!client.inflight(120));
    }

    #[test]
    fn ignore_reply_from_wrong_address() {
        let client = sim_socket();
        let server = sim_socket();
        let stranger = sim_socket();
        let (sender, _receiver) = flume::unbounded();

        let request = packet(&client, &server, 8, PacketBody::Request(Request::Ping));
        client
            .request(
                server.local_addr(),
                &request,
                Waiter::Probe(sender),
                Duration::from_secs(5),
            )
            .unwrap();

        assert!(client.take_inflight(8, &stranger.local_addr()).is_none());
        assert!(client.inflight(8));
    }

    #[test]
    fn drop_malformed_packets() {
        let client = sim_socket();
        let server = udp::sim::UdpSocket::bind().unwrap();

        server.send_to(&[1, 2, 3], client.local_addr()).unwrap();

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(50) {
            assert!(client.recv_from().is_none());
        }
    }
}
