//! Spoof protection ids handed out to remote IPs.
//!
//! A remote node learns its random id from our find-node replies, and has to
//! echo it back in store and key-block requests, proving it can receive
//! packets at the address it claims.

use crc::{Crc, CRC_32_ISCSI};
use rand::{thread_rng, Rng};
use std::{
    fmt::{self, Debug, Formatter},
    net::IpAddr,
    time::{Duration, Instant},
};

use tracing::trace;

const SECRET_SIZE: usize = 20;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Secrets rotate this often, ids from the previous secret remain valid.
pub const SECRET_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// Random ids generator.
pub struct SpoofTokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for SpoofTokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SpoofTokens (_)")
    }
}

impl SpoofTokens {
    pub fn new() -> Self {
        let mut rng = thread_rng();

        SpoofTokens {
            prev_secret: rng.gen(),
            curr_secret: rng.gen(),
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    /// Validate that the id was generated for this ip within the past two rotations.
    pub fn validate(&self, ip: IpAddr, random_id: u32) -> bool {
        random_id == random_id_for(ip, &self.curr_secret)
            || random_id == random_id_for(ip, &self.prev_secret)
    }

    pub fn generate(&mut self, ip: IpAddr) -> u32 {
        if self.last_updated.elapsed() > SECRET_ROTATE_INTERVAL {
            self.rotate();
        }

        random_id_for(ip, &self.curr_secret)
    }

    fn rotate(&mut self) {
        trace!(context = "spoof_tokens", "Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = thread_rng().gen();

        self.last_updated = Instant::now();
    }
}

impl Default for SpoofTokens {
    fn default() -> Self {
        Self::new()
    }
}

fn random_id_for(ip: IpAddr, secret: &[u8; SECRET_SIZE]) -> u32 {
    let mut digest = CASTAGNOLI.digest();

    match ip {
        IpAddr::V4(v4) => digest.update(&v4.octets()),
        IpAddr::V6(v6) => digest.update(&v6.octets()),
    };
    digest.update(secret);

    digest.finalize()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_random_ids() {
        let mut tokens = SpoofTokens::new();

        let ip: IpAddr = [127, 0, 0, 1].into();
        let random_id = tokens.generate(ip);

        assert!(tokens.validate(ip, random_id));
        assert!(!tokens.validate([127, 0, 0, 2].into(), random_id));
    }

    #[test]
    fn previous_secret_still_valid() {
        let mut tokens = SpoofTokens::new();

        let ip: IpAddr = [10, 0, 0, 1].into();
        let random_id = tokens.generate(ip);

        tokens.rotate();
        assert!(tokens.validate(ip, random_id));

        tokens.rotate();
        assert!(!tokens.validate(ip, random_id));
    }
}
