//! Bounded registries of recently seen contacts.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use rand::seq::SliceRandom;

use crate::common::{Contact, NodeStatus, PROTOCOL_VERSION_XFER_STATUS};

use super::lock;

pub const CONTACT_HISTORY_MAX: usize = 32;
pub const ROUTABLE_CONTACT_HISTORY_MAX: usize = 32;
pub const RECENT_REPORTS_HISTORY_MAX: usize = 32;

#[derive(Debug)]
pub(crate) struct ContactTracker {
    /// Every contact we recently heard from, by transport address.
    history: Mutex<LruCache<SocketAddr, Contact>>,
    /// Contacts that reported themselves as publicly routable.
    routable: Mutex<LruCache<SocketAddr, Contact>>,
    /// Peers already told that their advertised address is wrong.
    recent_reports: Mutex<LruCache<String, ()>>,

    other_routable_total: AtomicU64,
    other_non_routable_total: AtomicU64,
}

impl ContactTracker {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(LruCache::new(capacity(CONTACT_HISTORY_MAX))),
            routable: Mutex::new(LruCache::new(capacity(ROUTABLE_CONTACT_HISTORY_MAX))),
            recent_reports: Mutex::new(LruCache::new(capacity(RECENT_REPORTS_HISTORY_MAX))),
            other_routable_total: AtomicU64::new(0),
            other_non_routable_total: AtomicU64::new(0),
        }
    }

    pub fn contact_alive(&self, contact: &Contact) {
        lock(&self.history).put(contact.transport_address(), contact.clone());
    }

    /// Add an imported contact to the history, unless that would evict a contact we heard from.
    pub fn add_if_room(&self, contact: &Contact) {
        let mut history = lock(&self.history);

        if history.len() < history.cap().get() {
            history.put(contact.transport_address(), contact.clone());
        }
    }

    /// Returns true if we heard from this address recently, without touching its recency.
    pub fn is_known(&self, address: &SocketAddr) -> bool {
        lock(&self.history).contains(address)
    }

    /// Up to `count` random contacts from the history.
    pub fn sample(&self, count: usize) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = lock(&self.history)
            .iter()
            .map(|(_, contact)| contact.clone())
            .collect();

        contacts.shuffle(&mut rand::thread_rng());
        contacts.truncate(count);

        contacts
    }

    pub fn update_contact_status(&self, contact: &Contact, status: NodeStatus) {
        if contact.protocol_version() < PROTOCOL_VERSION_XFER_STATUS {
            return;
        }

        match status {
            NodeStatus::Unknown => {}
            NodeStatus::Routable => {
                self.other_routable_total.fetch_add(1, Ordering::Relaxed);

                let mut contact = contact.clone();
                contact.set_node_status(status);
                lock(&self.routable).put(contact.transport_address(), contact);
            }
            NodeStatus::None => {
                self.other_non_routable_total
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Contacts that recently reported themselves routable, most recent first.
    pub fn reachable_contacts(&self) -> Vec<Contact> {
        lock(&self.routable)
            .iter()
            .map(|(_, contact)| contact.clone())
            .collect()
    }

    /// Returns the number of routable and non-routable status reports seen.
    pub fn routable_totals(&self) -> (u64, u64) {
        (
            self.other_routable_total.load(Ordering::Relaxed),
            self.other_non_routable_total.load(Ordering::Relaxed),
        )
    }

    /// Returns true the first time a peer string is reported.
    pub fn report_once(&self, peer: String) -> bool {
        lock(&self.recent_reports).put(peer, ()).is_none()
    }

    pub fn remove(&self, contact: &Contact) {
        let address = contact.transport_address();

        lock(&self.history).pop(&address);
        lock(&self.routable).pop(&address);
    }
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

#[cfg(test)]
mod test {
    use super::*;

    fn contact(i: u16, version: u8) -> Contact {
        Contact::new(SocketAddr::from(([10, 0, (i >> 8) as u8, i as u8], 6881)), version)
    }

    #[test]
    fn imported_contacts_never_evict() {
        let tracker = ContactTracker::new();
        let version = PROTOCOL_VERSION_XFER_STATUS;

        tracker.add_if_room(&contact(0, version));
        assert!(tracker.is_known(&contact(0, version).transport_address()));

        for i in 1..CONTACT_HISTORY_MAX as u16 {
            tracker.contact_alive(&contact(i, version));
        }

        let imported = contact(1000, version);
        tracker.add_if_room(&imported);

        assert!(!tracker.is_known(&imported.transport_address()));
        for i in 0..CONTACT_HISTORY_MAX as u16 {
            assert!(tracker.is_known(&contact(i, version).transport_address()));
        }
    }

    #[test]
    fn routable_contacts_need_status_support() {
        let tracker = ContactTracker::new();

        let version = PROTOCOL_VERSION_XFER_STATUS;

        tracker.update_contact_status(&contact(1, version - 1), NodeStatus::Routable);
        tracker.update_contact_status(&contact(2, version), NodeStatus::Unknown);
        tracker.update_contact_status(&contact(3, version), NodeStatus::None);
        assert!(tracker.reachable_contacts().is_empty());
        assert_eq!(tracker.routable_totals(), (0, 1));

        let c = contact(4, version);
        tracker.update_contact_status(&c, NodeStatus::Routable);

        let reachable = tracker.reachable_contacts();
        assert_eq!(reachable.len(), 1);
        assert_eq!(reachable[0].transport_address(), c.transport_address());
        assert_eq!(reachable[0].node_status(), NodeStatus::Routable);
    }

    #[test]
    fn routable_registry_evicts_least_recently_touched() {
        let tracker = ContactTracker::new();
        let version = PROTOCOL_VERSION_XFER_STATUS;

        for i in 0..ROUTABLE_CONTACT_HISTORY_MAX as u16 {
            tracker.update_contact_status(&contact(i, version), NodeStatus::Routable);
        }

        // Touch the oldest entry, so the second oldest is evicted instead.
        let touched = contact(0, version);
        tracker.update_contact_status(&touched, NodeStatus::Routable);
        tracker.update_contact_status(&contact(1000, version), NodeStatus::Routable);

        let addresses: Vec<SocketAddr> = tracker
            .reachable_contacts()
            .iter()
            .map(|c| c.transport_address())
            .collect();

        assert_eq!(addresses.len(), ROUTABLE_CONTACT_HISTORY_MAX);
        assert!(addresses.contains(&touched.transport_address()));
        assert!(!addresses.contains(&contact(1, version).transport_address()));
        assert!(addresses.contains(&contact(1000, version).transport_address()));
    }

    #[test]
    fn history_and_reports() {
        let tracker = ContactTracker::new();
        let c = contact(7, 16);

        assert!(!tracker.is_known(&c.transport_address()));
        tracker.contact_alive(&c);
        assert!(tracker.is_known(&c.transport_address()));
        assert_eq!(tracker.sample(16), vec![c.clone()]);

        tracker.remove(&c);
        assert!(!tracker.is_known(&c.transport_address()));

        assert!(tracker.report_once(c.to_string()));
        assert!(!tracker.report_once(c.to_string()));
    }
}
