//! External address discovery from the consensus of contacted peers.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::common::{Contact, Request};

use super::{lock, read, rpc::Waiter, write, Transport};

/// Number of agreeing reports needed to adopt an external address.
pub const MIN_AGREEING_REPORTS: u8 = 3;
/// Maximum number of contacts asked about our external address.
pub const CONTACT_HISTORY_PING_SIZE: usize = 16;
/// Disputes are ignored for this long after the last address change.
pub const ADDRESS_CHANGE_MIN_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Vote {
    Pending,
    Adopted(IpAddr),
    /// A report disagreed with the previous ones.
    Disputed,
}

/// Agreement of consecutive reports, the first disagreement aborts.
#[derive(Debug, Default)]
pub(crate) struct AddressConsensus {
    candidate: Option<IpAddr>,
    matches: u8,
}

impl AddressConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vote(&mut self, ip: IpAddr) -> Vote {
        match self.candidate {
            Some(candidate) if candidate != ip => return Vote::Disputed,
            Some(_) => self.matches += 1,
            None => {
                self.candidate = Some(ip);
                self.matches = 1;
            }
        }

        if self.matches >= MIN_AGREEING_REPORTS {
            Vote::Adopted(ip)
        } else {
            Vote::Pending
        }
    }
}

#[derive(Debug)]
pub(crate) struct AddressState {
    external_ip: RwLock<IpAddr>,
    /// Serializes discovery, so address change notifications never race.
    discovery: Mutex<()>,
    last_change: Mutex<Option<Instant>>,
}

impl AddressState {
    pub fn new(external_ip: IpAddr) -> Self {
        Self {
            external_ip: RwLock::new(external_ip),
            discovery: Mutex::new(()),
            last_change: Mutex::new(None),
        }
    }
}

impl Transport {
    /// The external ip this node currently advertises.
    pub fn external_ip(&self) -> IpAddr {
        *read(&self.0.address.external_ip)
    }

    /// Determine the external ip, from the configured override or by asking
    /// up to [CONTACT_HISTORY_PING_SIZE] recently seen contacts.
    ///
    /// Keeps the current address if the contacts disagree, and falls back
    /// to `default` if too few of them reply.
    ///
    /// Blocks while contacts are asked, so it must not be called from a
    /// [crate::RequestHandler] callback.
    pub fn refresh_external_address(&self, default: IpAddr) -> IpAddr {
        let _guard = lock(&self.0.address.discovery);

        let new_ip = match self.0.config.external_ip {
            Some(ip) => {
                debug!(
                    context = "external_address",
                    %ip,
                    "External IP address explicitly overridden"
                );
                ip
            }
            None => match self.probe_external_ip() {
                Vote::Adopted(ip) => ip,
                Vote::Disputed => return self.external_ip(),
                Vote::Pending => {
                    debug!(context = "external_address", %default, "External IP address defaulted");
                    default
                }
            },
        };

        let old_ip = std::mem::replace(&mut *write(&self.0.address.external_ip), new_ip);

        if old_ip != new_ip {
            info!(context = "external_address", %old_ip, %new_ip, "External IP address changed");

            self.0.listeners.current_address(new_ip);
            self.set_local_contact(new_ip);
        }

        new_ip
    }

    /// A peer replied that our advertised address is wrong.
    pub(crate) fn address_disputed(&self, reporter: &Contact, reported: SocketAddr) {
        let new_ip = reported.ip();

        if new_ip == self.external_ip() {
            return;
        }

        {
            let mut last_change = lock(&self.0.address.last_change);

            if last_change.is_some_and(|at| at.elapsed() < ADDRESS_CHANGE_MIN_INTERVAL) {
                return;
            }

            debug!(
                context = "external_address",
                %reporter,
                %reported,
                "Node reported a different external IP address"
            );

            if is_invalid_external_ip(&new_ip) {
                debug!(context = "external_address", %new_ip, "Ignoring private address");
                return;
            }

            if reporter.external_address().ip() == new_ip {
                debug!(
                    context = "external_address",
                    %new_ip,
                    "Ignoring address equal to the reporter's address"
                );
                return;
            }

            *last_change = Some(Instant::now());
        }

        let transport = self.clone();
        let spawned = thread::Builder::new()
            .name("dht-udp-address".into())
            .spawn(move || {
                transport.refresh_external_address(new_ip);
            });

        if let Err(error) = spawned {
            debug!(context = "external_address", ?error, "Failed to spawn address discovery");
        }
    }

    // === Private Methods ===

    fn probe_external_ip(&self) -> Vote {
        let contacts = self.0.contacts.sample(CONTACT_HISTORY_PING_SIZE);
        let mut consensus = AddressConsensus::new();

        debug!(
            context = "external_address",
            contacts = contacts.len(),
            "Obtaining external address"
        );

        for contact in contacts {
            let Some(address) = self.ask_for_external_address(&contact) else {
                trace!(context = "external_address", %contact, "Contact didn't reply");
                continue;
            };

            trace!(
                context = "external_address",
                %contact,
                %address,
                "Contact reported our address"
            );

            match consensus.vote(address.ip()) {
                Vote::Pending => {}
                Vote::Adopted(ip) => {
                    debug!(
                        context = "external_address",
                        %ip,
                        "External IP address obtained from contacts"
                    );
                    return Vote::Adopted(ip);
                }
                Vote::Disputed => {
                    debug!(context = "external_address", %contact, "Abandoning due to mismatch");
                    return Vote::Disputed;
                }
            }
        }

        Vote::Pending
    }

    fn ask_for_external_address(&self, contact: &Contact) -> Option<SocketAddr> {
        let (sender, receiver) = flume::bounded(1);
        let timeout = self.0.config.address_probe_timeout;

        self.request(contact, Request::Ping, Waiter::Probe(sender), timeout)
            .ok()?;

        // The IO thread answers every probe, by a reply or once it times out.
        receiver.recv_timeout(timeout * 2).ok().flatten()
    }

    fn set_local_contact(&self, ip: IpAddr) {
        let port = self.0.socket.local_addr().port();

        let contact = {
            let mut local_contact = write(&self.0.local_contact);
            *local_contact = Contact::local(
                SocketAddr::new(ip, port),
                self.0.config.protocol_version,
                local_contact.instance_id(),
                rand::random(),
            );
            local_contact.clone()
        };

        info!(context = "external_address", %contact, "Local contact changed");

        self.0.listeners.local_contact_changed(&contact);
    }
}

/// Private, loopback and link-local addresses can't be external addresses.
pub(crate) fn is_invalid_external_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];

            v6.is_loopback()
                || v6.is_unspecified()
                // Unique local fc00::/7
                || first & 0xfe00 == 0xfc00
                // Link local fe80::/10
                || first & 0xffc0 == 0xfe80
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn three_agreeing_reports_adopt() {
        let mut consensus = AddressConsensus::new();
        let ip: IpAddr = [1, 2, 3, 4].into();

        assert_eq!(consensus.vote(ip), Vote::Pending);
        assert_eq!(consensus.vote(ip), Vote::Pending);
        assert_eq!(consensus.vote(ip), Vote::Adopted(ip));
    }

    #[test]
    fn disagreement_aborts() {
        let mut consensus = AddressConsensus::new();
        let ip: IpAddr = [1, 2, 3, 4].into();

        assert_eq!(consensus.vote(ip), Vote::Pending);
        assert_eq!(consensus.vote(ip), Vote::Pending);
        assert_eq!(consensus.vote([5, 6, 7, 8].into()), Vote::Disputed);
    }

    #[test]
    fn invalid_external_ips() {
        for ip in [
            "10.0.0.1",
            "192.168.1.1",
            "172.16.0.1",
            "127.0.0.1",
            "169.254.0.1",
            "0.0.0.0",
            "::1",
            "fd00::1",
            "fe80::1",
        ] {
            assert!(is_invalid_external_ip(&ip.parse().unwrap()), "{ip}");
        }

        for ip in ["8.8.8.8", "2001:db8::1"] {
            assert!(!is_invalid_external_ip(&ip.parse().unwrap()), "{ip}");
        }
    }
}
