//! Peer address keys.
//!
//! Sessions are keyed by the peer's *base address*: the `(ip, base_port)`
//! pair the peer listens on. Datagrams may arrive from any ephemeral port
//! of the peer process; the base port travels in the Connect payload and is
//! stable for the lifetime of the peer.

use std::net::{IpAddr, SocketAddr};

/// A peer's listening address, used as the session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BaseAddress {
    /// Peer IP address.
    pub ip: IpAddr,
    /// Peer base (listening) port, taken from the Connect payload.
    pub port: u16,
}

impl BaseAddress {
    /// Build a base address from an IP and a base port.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The socket address form of this key.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }
}

impl From<SocketAddr> for BaseAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl std::fmt::Display for BaseAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Key for sessions relayed across a gateway: the peer base address plus
/// the network id the peer lives in. Two peers in different networks may
/// share the same private address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayAddress {
    pub base: BaseAddress,
    pub network_id: u32,
}

impl RelayAddress {
    pub fn new(base: BaseAddress, network_id: u32) -> Self {
        Self { base, network_id }
    }
}

impl std::fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.base, self.network_id)
    }
}

/// Derive the session key for a datagram: source IP plus the advertised
/// base port.
pub fn base_address_of(src: SocketAddr, base_port: u16) -> BaseAddress {
    BaseAddress::new(src.ip(), base_port)
}
