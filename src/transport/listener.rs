//! Event listeners.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use crate::common::Contact;

use super::{read, write};

/// Notified about changes of the local node's addressing and reachability.
pub trait TransportListener: Send + Sync {
    /// The external ip was (re)determined.
    fn current_address(&self, _ip: IpAddr) {}
    /// The local contact was recreated after an external address change.
    fn local_contact_changed(&self, _contact: &Contact) {}
    fn reachability_changed(&self, _reachable: bool) {}
}

/// Progress of a single chunked transfer.
pub trait TransferListener {
    fn report_size(&self, _size: u64) {}
    fn report_activity(&self, _activity: &str) {}
    fn report_completeness(&self, _percent: u8) {}
}

impl TransferListener for () {}

#[derive(Default)]
pub(crate) struct Listeners(RwLock<Vec<Arc<dyn TransportListener>>>);

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listeners({})", read(&self.0).len())
    }
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn TransportListener>) {
        write(&self.0).push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn TransportListener>) {
        write(&self.0).retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn current_address(&self, ip: IpAddr) {
        self.snapshot()
            .iter()
            .for_each(|listener| listener.current_address(ip));
    }

    pub fn local_contact_changed(&self, contact: &Contact) {
        self.snapshot()
            .iter()
            .for_each(|listener| listener.local_contact_changed(contact));
    }

    pub fn reachability_changed(&self, reachable: bool) {
        self.snapshot()
            .iter()
            .for_each(|listener| listener.reachability_changed(reachable));
    }

    // Listeners are called outside of the lock, so they may add or remove listeners.
    fn snapshot(&self) -> Vec<Arc<dyn TransportListener>> {
        read(&self.0).clone()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<bool>>);

    impl TransportListener for Recorder {
        fn reachability_changed(&self, reachable: bool) {
            self.0.lock().unwrap().push(reachable);
        }
    }

    #[test]
    fn add_notify_remove() {
        let listeners = Listeners::default();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn TransportListener> = recorder.clone();

        listeners.add(listener.clone());
        listeners.reachability_changed(true);

        listeners.remove(&listener);
        listeners.reachability_changed(false);

        assert_eq!(*recorder.0.lock().unwrap(), vec![true]);
    }
}
