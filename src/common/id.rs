//! DHT node Id derived from a contact's address.
use std::fmt::{self, Debug, Display, Formatter};
use std::net::SocketAddr;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// Node Id, the SHA-1 of the node's advertised `ip:port`.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// The Id a node advertising `address` is expected to have.
    pub fn for_address(address: &SocketAddr) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(address.to_string().as_bytes());

        Id(hasher.digest().bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_address_same_id() {
        let a: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        let b: SocketAddr = "1.2.3.4:6882".parse().unwrap();

        assert_eq!(Id::for_address(&a), Id::for_address(&a));
        assert_ne!(Id::for_address(&a), Id::for_address(&b));
    }

    #[test]
    fn display_hex() {
        let id = Id([0xab; ID_SIZE]);

        assert_eq!(id.to_string(), "ab".repeat(ID_SIZE));
    }
}
