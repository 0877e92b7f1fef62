//! UDP transport of a DHT node.
//!
//! A [Transport] owns one socket and an IO thread that receives packets,
//! dispatches inbound requests to the [RequestHandler], correlates replies
//! with their inflight requests, expires timed out requests and samples
//! reachability statistics.

mod address;
mod config;
mod contacts;
mod dispatch;
mod filter;
mod listener;
mod reachability;
mod rpc;
mod socket;
mod stats;
mod tokens;
mod transfer;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info};

use crate::common::{Contact, NodeStatus, RequestKind};
use crate::{Error, Result};

use self::address::AddressState;
use self::contacts::ContactTracker;
use self::filter::AddressFilter;
use self::listener::Listeners;
use self::reachability::Reachability;
use self::socket::{DhtSocket, MAX_THREAD_BLOCK_DURATION};
use self::stats::Counters;
use self::tokens::SpoofTokens;
use self::transfer::Transfers;

pub use self::address::{
    ADDRESS_CHANGE_MIN_INTERVAL, CONTACT_HISTORY_PING_SIZE, MIN_AGREEING_REPORTS,
};
pub use self::config::*;
pub use self::contacts::{
    CONTACT_HISTORY_MAX, RECENT_REPORTS_HISTORY_MAX, ROUTABLE_CONTACT_HISTORY_MAX,
};
pub use self::dispatch::{FindValueOutcome, RequestHandler, StoreOutcome};
pub use self::filter::RangeFilter;
pub use self::listener::{TransferListener, TransportListener};
pub use self::reachability::STATS_WINDOW;
pub use self::rpc::{ReplySender, Response, RpcOutcome};
pub use self::socket::udp;
pub use self::stats::{RequestCounts, TransportStats};
pub use self::transfer::{TransferHandler, CALL_KEY_SIZE};

/// A cloneable handle to a running transport.
///
/// The IO thread exits once every handle is dropped.
#[derive(Clone)]
pub struct Transport(pub(crate) Arc<Inner>);

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) socket: DhtSocket,
    pub(crate) local_contact: RwLock<Contact>,
    pub(crate) request_handler: RwLock<Option<Arc<dyn RequestHandler>>>,

    pub(crate) contacts: ContactTracker,
    pub(crate) address: AddressState,
    pub(crate) reachability: Mutex<Reachability>,
    pub(crate) filter: AddressFilter,
    pub(crate) tokens: Mutex<SpoofTokens>,

    pub(crate) counters: Counters,
    pub(crate) listeners: Listeners,
    pub(crate) transfers: Transfers,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.local_addr())
            .field("local_contact", &*read(&self.0.local_contact))
            .field("transfers", &self.0.transfers)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Bind the socket and start the IO thread.
    pub fn new(mut config: Config) -> Result<Self> {
        if let Some(ip) = config.external_ip.filter(|ip| ip.is_unspecified()) {
            return Err(Error::InvalidAddress(ip.to_string()));
        }

        let socket = DhtSocket::new(config.socket.take(), config.port)?;
        let local_addr = socket.local_addr();

        let default_ip = config.external_ip.unwrap_or_else(|| {
            if local_addr.ip().is_unspecified() {
                Ipv4Addr::LOCALHOST.into()
            } else {
                local_addr.ip()
            }
        });

        let local_contact = Contact::local(
            SocketAddr::new(default_ip, local_addr.port()),
            config.protocol_version,
            rand::random(),
            rand::random(),
        );

        info!(context = "transport", %local_addr, %local_contact, "Transport listening");

        let filter = AddressFilter::new(
            config.ip_filter.take(),
            config.bad_ip_capacity,
            config.bad_ip_reset_fraction,
        );

        let transport = Transport(Arc::new(Inner {
            socket,
            local_contact: RwLock::new(local_contact),
            request_handler: RwLock::new(None),

            contacts: ContactTracker::new(),
            address: AddressState::new(default_ip),
            reachability: Mutex::new(Reachability::new(
                config.stats_init_period,
                config.initial_reachability,
            )),
            filter,
            tokens: Mutex::new(SpoofTokens::new()),

            counters: Counters::default(),
            listeners: Listeners::default(),
            transfers: Transfers::new(config.max_transfers),

            config,
        }));

        let weak = Arc::downgrade(&transport.0);
        thread::Builder::new()
            .name("dht-udp".into())
            .spawn(move || run(weak))?;

        Ok(transport)
    }

    // === Getters ===

    /// The contact this node advertises to others.
    pub fn local_contact(&self) -> Contact {
        read(&self.0.local_contact).clone()
    }

    /// Returns the address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.0.socket.local_addr()
    }

    pub fn protocol_version(&self) -> u8 {
        self.0.config.protocol_version
    }

    /// A snapshot of the traffic counters.
    pub fn stats(&self) -> TransportStats {
        self.0.counters.snapshot()
    }

    /// Whether unsolicited requests show this node is publicly reachable.
    pub fn is_reachable(&self) -> bool {
        lock(&self.0.reachability).is_reachable()
    }

    /// Status advertised in find-node replies.
    pub fn node_status(&self) -> NodeStatus {
        lock(&self.0.reachability).node_status(self.0.config.bootstrap_node)
    }

    /// Contacts that recently reported themselves publicly routable.
    pub fn reachable_contacts(&self) -> Vec<Contact> {
        self.0.contacts.reachable_contacts()
    }

    /// Number of routable and non-routable node status reports seen.
    pub fn routable_totals(&self) -> (u64, u64) {
        self.0.contacts.routable_totals()
    }

    // === Public Methods ===

    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *write(&self.0.request_handler) = Some(handler);
    }

    /// Add a listener, immediately told the current external ip.
    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        listener.current_address(self.external_ip());
        self.0.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TransportListener>) {
        self.0.listeners.remove(listener);
    }

    /// Fails with [crate::Error::FilteredAddress] if the admission filter rejects the contact.
    pub fn check_address(&self, contact: &Contact) -> Result<()> {
        self.0.filter.check(contact)
    }

    /// Record a node status reported by (or about) `contact`.
    pub fn update_contact_status(&self, contact: &Contact, status: NodeStatus) {
        self.0.contacts.update_contact_status(contact, status);
    }

    /// Returns true if the contact's random id was handed out by this node to its ip.
    pub fn is_valid_random_id(&self, contact: &Contact) -> bool {
        lock(&self.0.tokens).validate(contact.transport_address().ip(), contact.random_id())
    }

    /// Deserialize a contact exported with [Transport::export_contact],
    /// then import it like [Transport::import_address].
    pub fn import_contact(&self, bytes: &[u8]) -> Result<Contact> {
        Ok(self.imported(Contact::import(bytes)?))
    }

    /// A contact for `address`, added to the contact history while it has room,
    /// and handed to [RequestHandler::contact_imported].
    pub fn import_address(&self, address: SocketAddr, protocol_version: u8) -> Contact {
        self.imported(Contact::new(address, protocol_version))
    }

    pub fn export_contact(&self, contact: &Contact) -> Bytes {
        contact.export()
    }

    /// Forget a contact, and tell the [RequestHandler] about it.
    pub fn remove_contact(&self, contact: &Contact) {
        self.0.contacts.remove(contact);

        if let Some(handler) = self.request_handler() {
            handler.contact_removed(contact);
        }
    }

    // === Crate Methods ===

    fn imported(&self, contact: Contact) -> Contact {
        self.0.contacts.add_if_room(&contact);

        if let Some(handler) = self.request_handler() {
            handler.contact_imported(&contact);
        }

        contact
    }

    pub(crate) fn request_handler(&self) -> Option<Arc<dyn RequestHandler>> {
        read(&self.0.request_handler).clone()
    }

    /// A random connection id with the top bit set, unused by any inflight
    /// request or transfer.
    pub(crate) fn new_connection_id(&self) -> u64 {
        loop {
            let connection_id = rand::random::<u64>() | (1 << 63);

            if !self.0.socket.is_connection_id_inflight(connection_id)
                && !self.0.transfers.contains(connection_id)
            {
                return connection_id;
            }
        }
    }

    // === Private Methods ===

    fn tick(&self, timers: &mut Timers) {
        if let Some((packet, size, from)) = self.0.socket.recv_from() {
            self.0.counters.packet_received(size);

            if packet.is_request() {
                self.handle_request(packet, from);
            } else {
                self.handle_reply(packet, from);
            }
        }

        if timers.sweep.elapsed() >= MAX_THREAD_BLOCK_DURATION {
            timers.sweep = Instant::now();

            for request in self.0.socket.take_expired() {
                self.request_timed_out(request);
            }
        }

        if timers.stats.elapsed() >= self.0.config.stats_period {
            timers.stats = Instant::now();
            self.sample_reachability();
        }
    }

    fn sample_reachability(&self) {
        let stats = self.0.counters.snapshot();

        let changed = lock(&self.0.reachability).sample(
            stats.aliens(),
            stats.requests(RequestKind::FindValue).alien,
            self.0.config.stats_period,
        );

        if let Some(reachable) = changed {
            info!(context = "reachability", reachable, "Reachability changed");

            self.0.listeners.reachability_changed(reachable);
        }
    }
}

struct Timers {
    sweep: Instant,
    stats: Instant,
}

fn run(weak: Weak<Inner>) {
    let mut timers = Timers {
        sweep: Instant::now(),
        stats: Instant::now(),
    };

    while let Some(inner) = weak.upgrade() {
        Transport(inner).tick(&mut timers);
    }

    debug!(context = "transport", "Transport dropped, IO thread exiting");
}

// Poisoned locks are recovered, every critical section leaves its data consistent.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::common::PROTOCOL_VERSION;

    fn transport() -> Transport {
        Transport::new(Config {
            socket: Some(udp::sim::UdpSocket::bind().unwrap()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn local_contact_matches_socket() {
        let transport = transport();
        let local_contact = transport.local_contact();

        assert_eq!(local_contact.external_address(), transport.local_addr());
        assert!(local_contact.address_matches_id());
        assert_eq!(local_contact.protocol_version(), PROTOCOL_VERSION);
        assert_eq!(transport.external_ip(), transport.local_addr().ip());
    }

    #[test]
    fn external_ip_override() {
        let transport = Transport::new(Config {
            socket: Some(udp::sim::UdpSocket::bind().unwrap()),
            external_ip: Some([8, 8, 4, 4].into()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(transport.local_contact().external_address().ip(), std::net::IpAddr::from([8u8, 8, 4, 4]));
        assert_eq!(transport.refresh_external_address([1, 1, 1, 1].into()), std::net::IpAddr::from([8u8, 8, 4, 4]));
    }

    #[test]
    fn unspecified_external_ip_rejected() {
        let result = Transport::new(Config {
            socket: Some(udp::sim::UdpSocket::bind().unwrap()),
            external_ip: Some(Ipv4Addr::UNSPECIFIED.into()),
            ..Default::default()
        });

        assert_eq!(result.err(), Some(Error::InvalidAddress("0.0.0.0".into())));
    }

    #[test]
    fn connection_ids_have_top_bit_set() {
        let transport = transport();

        for _ in 0..100 {
            assert!(transport.new_connection_id() & (1 << 63) != 0);
        }
    }

    #[test]
    fn io_thread_exits_when_dropped() {
        let transport = transport();
        let address = transport.local_addr();

        drop(transport);

        // The socket is released once the IO thread lets go of the transport.
        let start = Instant::now();
        loop {
            if udp::sim::UdpSocket::bind_addr(address).is_ok() {
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(1), "IO thread still running");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn import_export_contact() {
        let transport = transport();
        let contact = transport.import_address("4.4.4.4:7000".parse().unwrap(), 14);

        let bytes = transport.export_contact(&contact);
        assert_eq!(transport.import_contact(&bytes).unwrap(), contact);
    }

    #[test]
    fn imported_contacts_join_history_and_reach_the_handler() {
        #[derive(Default)]
        struct Imports(Mutex<Vec<SocketAddr>>);

        impl RequestHandler for Imports {
            fn contact_imported(&self, contact: &Contact) {
                lock(&self.0).push(contact.transport_address());
            }
        }

        let transport = transport();
        let handler = Arc::new(Imports::default());
        transport.set_request_handler(handler.clone());

        let address: SocketAddr = "4.4.4.4:7000".parse().unwrap();
        let exported = Contact::new("5.5.5.5:7000".parse().unwrap(), 14).export();

        transport.import_address(address, 14);
        let contact = transport.import_contact(&exported).unwrap();

        assert!(transport.0.contacts.is_known(&address));
        assert!(transport.0.contacts.is_known(&contact.transport_address()));
        assert_eq!(*lock(&handler.0), vec![address, contact.transport_address()]);
    }

    #[test]
    fn initial_reachability_from_config() {
        let transport = Transport::new(Config {
            socket: Some(udp::sim::UdpSocket::bind().unwrap()),
            initial_reachability: true,
            ..Default::default()
        })
        .unwrap();

        assert!(transport.is_reachable());
        assert_eq!(transport.node_status(), NodeStatus::Unknown);
        assert!(!self::transport().is_reachable());
    }
}
