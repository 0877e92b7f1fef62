//! IP admission filtering.

use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Mutex;

use tracing::debug;

use crate::common::Contact;
use crate::{Error, Result};

use super::lock;

const HASH_COUNT: usize = 3;

/// An external (usually range based) IP filter, consulted at most once per bad address.
pub trait RangeFilter: Debug + Send + Sync {
    /// Returns true if packets from and to this ip should be dropped.
    fn is_blocked(&self, ip: IpAddr) -> bool;
}

/// Add-only bloom filter over ip addresses.
#[derive(Debug)]
pub(crate) struct BloomFilter {
    bits: Vec<u64>,
    entries: usize,
}

impl BloomFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            bits: vec![0; capacity.max(64).div_ceil(64)],
            entries: 0,
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.positions(ip)
            .iter()
            .all(|position| self.bits[position / 64] & (1 << (position % 64)) != 0)
    }

    pub fn add(&mut self, ip: &IpAddr) {
        for position in self.positions(ip) {
            self.bits[position / 64] |= 1 << (position % 64);
        }
        self.entries += 1;
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
        self.entries = 0;
    }

    fn positions(&self, ip: &IpAddr) -> [usize; HASH_COUNT] {
        let mut hasher = sha1_smol::Sha1::new();
        match ip {
            IpAddr::V4(v4) => hasher.update(&v4.octets()),
            IpAddr::V6(v6) => hasher.update(&v6.octets()),
        }
        let digest = hasher.digest().bytes();
        let size = self.bits.len() * 64;

        let mut positions = [0; HASH_COUNT];
        for (i, position) in positions.iter_mut().enumerate() {
            let word = [
                digest[i * 4],
                digest[i * 4 + 1],
                digest[i * 4 + 2],
                digest[i * 4 + 3],
            ];
            *position = u32::from_be_bytes(word) as usize % size;
        }

        positions
    }
}

/// Bad-IP set in front of an optional [RangeFilter].
#[derive(Debug)]
pub(crate) struct AddressFilter {
    range: Option<Box<dyn RangeFilter>>,
    bad_ips: Mutex<BloomFilter>,
    reset_threshold: usize,
}

impl AddressFilter {
    pub fn new(range: Option<Box<dyn RangeFilter>>, capacity: usize, reset_fraction: f64) -> Self {
        let reset_threshold = ((capacity as f64 * reset_fraction) as usize).max(1);

        Self {
            range,
            bad_ips: Mutex::new(BloomFilter::new(capacity)),
            reset_threshold,
        }
    }

    /// Fails with [Error::FilteredAddress] if the contact's transport address is blocked.
    pub fn check(&self, contact: &Contact) -> Result<()> {
        let Some(range) = &self.range else {
            return Ok(());
        };

        let address = contact.transport_address();
        let ip = address.ip();

        if lock(&self.bad_ips).contains(&ip) {
            return Err(Error::FilteredAddress(address));
        }

        if range.is_blocked(ip) {
            let mut bad_ips = lock(&self.bad_ips);

            if bad_ips.entries() >= self.reset_threshold {
                debug!(context = "ip_filter", "Resetting bad ip set");
                bad_ips.clear();
            }
            bad_ips.add(&ip);

            return Err(Error::FilteredAddress(address));
        }

        Ok(())
    }
}
