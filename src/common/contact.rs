//! Identity and liveness of a remote (or the local) peer.

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::messages::wire;
use crate::common::Id;
use crate::Result;

/// Routability a peer reports about itself in find-node replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Not publicly routable (or a bootstrap node).
    None,
    /// Publicly routable.
    Routable,
    /// Not enough traffic observed to tell yet.
    Unknown,
}

impl NodeStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            NodeStatus::None => 0x00,
            NodeStatus::Routable => 0x01,
            NodeStatus::Unknown => 0xff,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0xff => NodeStatus::Unknown,
            v if v & 0x01 != 0 => NodeStatus::Routable,
            _ => NodeStatus::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A peer as known to this node.
///
/// `transport_address` is where its packets actually come from, while
/// `external_address` is what the peer claims to be. The two only differ
/// for misconfigured or NATed peers.
pub struct Contact {
    transport_address: SocketAddr,
    external_address: SocketAddr,
    protocol_version: u8,
    instance_id: u64,
    random_id: u32,
    node_status: NodeStatus,
}

impl Contact {
    /// Create a contact for a peer we only know the address of.
    pub fn new(address: SocketAddr, protocol_version: u8) -> Self {
        Self::remote(address, address, protocol_version, 0)
    }

    /// Create a contact from the addressing found in a packet.
    pub fn remote(
        transport_address: SocketAddr,
        external_address: SocketAddr,
        protocol_version: u8,
        instance_id: u64,
    ) -> Self {
        Self {
            transport_address,
            external_address,
            protocol_version,
            instance_id,
            random_id: 0,
            node_status: NodeStatus::Unknown,
        }
    }

    pub(crate) fn local(
        address: SocketAddr,
        protocol_version: u8,
        instance_id: u64,
        random_id: u32,
    ) -> Self {
        Self {
            transport_address: address,
            external_address: address,
            protocol_version,
            instance_id,
            random_id,
            node_status: NodeStatus::Unknown,
        }
    }

    // === Getters ===

    pub fn transport_address(&self) -> SocketAddr {
        self.transport_address
    }

    pub fn external_address(&self) -> SocketAddr {
        self.external_address
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Spoof-protection id handed out by this peer, echoed on store and key-block requests.
    pub fn random_id(&self) -> u32 {
        self.random_id
    }

    pub fn node_status(&self) -> NodeStatus {
        self.node_status
    }

    /// Node Id derived from the address this contact advertises.
    pub fn id(&self) -> Id {
        Id::for_address(&self.external_address)
    }

    /// Returns false if the peer's advertised address (and thus its Id)
    /// doesn't match where its packets come from.
    pub fn address_matches_id(&self) -> bool {
        self.id() == Id::for_address(&self.transport_address)
    }

    // === Setters ===

    pub(crate) fn set_instance_id_and_version(&mut self, instance_id: u64, protocol_version: u8) {
        self.instance_id = instance_id;
        self.protocol_version = protocol_version;
    }

    pub(crate) fn set_random_id(&mut self, random_id: u32) {
        self.random_id = random_id;
    }

    pub(crate) fn set_node_status(&mut self, node_status: NodeStatus) {
        self.node_status = node_status;
    }

    // === Serialization ===

    /// Serialize the contact's version and address, see [Contact::import].
    pub fn export(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + wire::MAX_ADDRESS_SIZE);
        self.export_into(&mut buf);

        buf.freeze()
    }

    pub(crate) fn export_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol_version);
        wire::put_address(buf, &self.external_address);
    }

    /// Deserialize a contact previously serialized with [Contact::export].
    pub fn import(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        Self::import_from(&mut buf)
    }

    pub(crate) fn import_from<B: Buf>(buf: &mut B) -> Result<Self> {
        let protocol_version = wire::get_u8(buf)?;
        let address = wire::get_address(buf)?;

        Ok(Contact::new(address, protocol_version))
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.transport_address == self.external_address {
            write!(f, "{} v{}", self.external_address, self.protocol_version)
        } else {
            write!(
                f,
                "{} [via {}] v{}",
                self.external_address, self.transport_address, self.protocol_version
            )
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_status_byte() {
        for status in [NodeStatus::None, NodeStatus::Routable, NodeStatus::Unknown] {
            assert_eq!(NodeStatus::from_u8(status.to_u8()), status);
        }

        assert_eq!(NodeStatus::from_u8(0x03), NodeStatus::Routable);
    }

    #[test]
    fn address_mismatch() {
        let transport: SocketAddr = "10.1.1.1:4000".parse().unwrap();
        let claimed: SocketAddr = "192.168.0.2:4000".parse().unwrap();

        assert!(Contact::new(transport, 16).address_matches_id());
        assert!(!Contact::remote(transport, claimed, 16, 1).address_matches_id());
    }

    #[test]
    fn export_import() {
        let contact = Contact::new("[2001:db8::1]:9000".parse().unwrap(), 14);
        let bytes = contact.export();

        assert_eq!(Contact::import(&bytes).unwrap(), contact);
        assert!(Contact::import(&bytes[..3]).is_err());
    }
}
