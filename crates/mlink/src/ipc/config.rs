//! Service configuration.
//!
//! All durations are wall-clock; zero disables the feature in question
//! (keep-alives). Counts of zero are replaced by the defaults when the
//! service starts, so a `Configuration` built from partial CLI flags is
//! always usable.

use std::net::SocketAddr;
use std::time::Duration;

use super::error::{Error, Result};

/// Per-session protocol tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Unacknowledged data packets allowed in flight per session.
    pub max_send_packet_count: u8,
    /// Distinct message fragments multiplexed into one packet.
    pub max_message_packet_count: u16,
    /// Messages concurrently interleaved on one session; the rest wait in
    /// the pending FIFO.
    pub max_send_message_queue_size: u32,
    /// Received packet ids held back before an update-only packet is forced.
    pub max_recv_no_update_count: usize,
    /// Idle keep-alive period; zero disables.
    pub keepalive: Duration,
    /// Keep-alive period while a request awaits its response; zero disables.
    pub response_keepalive: Duration,
    /// Keep-alive period for relayed sessions.
    pub relay_keepalive: Duration,
    /// Response keep-alive period for relayed sessions.
    pub relay_response_keepalive: Duration,
    /// Retransmits of a data packet before the session is declared dead.
    pub data_retransmit_count: u8,
    /// Retransmits of a Connect/Accept packet before giving up.
    pub connect_retransmit_count: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_send_packet_count: 6,
            max_message_packet_count: 4,
            max_send_message_queue_size: 32,
            max_recv_no_update_count: 4,
            keepalive: Duration::from_secs(20),
            response_keepalive: Duration::from_secs(10),
            relay_keepalive: Duration::from_secs(40),
            relay_response_keepalive: Duration::from_secs(20),
            data_retransmit_count: 8,
            connect_retransmit_count: 16,
        }
    }
}

/// Talker pool sizing.
#[derive(Debug, Clone)]
pub struct TalkerConfig {
    /// Sessions a single talker carries before the service prefers a new one.
    pub session_count: u32,
    /// Upper bound on talkers (and thus UDP sockets) per service.
    pub max_count: u32,
}

impl Default for TalkerConfig {
    fn default() -> Self {
        Self {
            session_count: 1024,
            max_count: 2,
        }
    }
}

/// Relay node sizing, relevant only on gateway processes.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Forwarding slots per node.
    pub session_count: u32,
    /// Sockets a node may use toward other networks.
    pub socket_count: u32,
    /// Upper bound on nodes per service.
    pub max_count: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            session_count: 1024,
            socket_count: 4,
            max_count: 1,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// The local listening address; its port is the base port advertised in
    /// every Connect.
    pub base_address: SocketAddr,
    /// Address the accepting talker binds; defaults to `base_address`.
    pub accept_address: Option<SocketAddr>,
    pub session: SessionConfig,
    pub talker: TalkerConfig,
    pub node: NodeConfig,
    /// Gateways this process uses to reach peers in other networks
    /// (endpoint side). Round-robined per relayed session.
    pub gateway_addresses: Vec<SocketAddr>,
    /// Addresses through which this process, acting as a gateway, reaches
    /// other networks. Non-empty marks the process as a relay gateway.
    pub relay_gateways: Vec<SocketAddr>,
    /// Identifier of the network this process lives in.
    pub local_network_id: u32,
}

impl Configuration {
    /// A configuration listening on the given address, everything else at
    /// defaults.
    pub fn new(base_address: SocketAddr) -> Self {
        Self {
            base_address,
            accept_address: None,
            session: SessionConfig::default(),
            talker: TalkerConfig::default(),
            node: NodeConfig::default(),
            gateway_addresses: Vec::new(),
            relay_gateways: Vec::new(),
            local_network_id: 0,
        }
    }

    /// The address the accepting talker binds.
    pub fn accept_address(&self) -> SocketAddr {
        self.accept_address.unwrap_or(self.base_address)
    }

    /// True when this process forwards traffic between networks.
    pub fn is_gateway(&self) -> bool {
        !self.relay_gateways.is_empty()
    }

    /// Replace zero counts with defaults and reject unusable combinations.
    pub fn prepare(&mut self) -> Result<()> {
        let defaults = SessionConfig::default();
        if self.session.max_send_packet_count == 0 {
            self.session.max_send_packet_count = defaults.max_send_packet_count;
        }
        if self.session.max_message_packet_count == 0 {
            self.session.max_message_packet_count = defaults.max_message_packet_count;
        }
        if self.session.max_send_message_queue_size == 0 {
            self.session.max_send_message_queue_size = defaults.max_send_message_queue_size;
        }
        if self.session.max_recv_no_update_count == 0 {
            self.session.max_recv_no_update_count = defaults.max_recv_no_update_count;
        }
        if self.session.data_retransmit_count == 0 {
            self.session.data_retransmit_count = defaults.data_retransmit_count;
        }
        if self.session.connect_retransmit_count == 0 {
            self.session.connect_retransmit_count = defaults.connect_retransmit_count;
        }
        if self.talker.session_count == 0 {
            self.talker.session_count = TalkerConfig::default().session_count;
        }
        if self.talker.max_count == 0 {
            self.talker.max_count = TalkerConfig::default().max_count;
        }

        // The keep-alive slot is slot 0; the send window must fit in the
        // remaining u8-indexed slots.
        if self.session.max_send_packet_count as usize >= u8::MAX as usize {
            return Err(Error::InvalidConfiguration(format!(
                "session.max_send_packet_count {} too large",
                self.session.max_send_packet_count
            )));
        }
        if self.base_address.port() == 0 {
            return Err(Error::InvalidConfiguration(
                "base_address must carry a concrete port".into(),
            ));
        }
        if let Some(accept) = self.accept_address
            && accept.is_ipv4() != self.base_address.is_ipv4()
        {
            return Err(Error::InvalidConfiguration(
                "accept_address and base_address families differ".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_counts_take_defaults() {
        let mut cfg = Configuration::new("127.0.0.1:4500".parse().unwrap());
        cfg.session.max_send_packet_count = 0;
        cfg.session.data_retransmit_count = 0;
        cfg.prepare().unwrap();
        assert_eq!(cfg.session.max_send_packet_count, 6);
        assert_eq!(cfg.session.data_retransmit_count, 8);
    }

    #[test]
    fn rejects_wildcard_port() {
        let mut cfg = Configuration::new("127.0.0.1:0".parse().unwrap());
        assert!(cfg.prepare().is_err());
    }

    #[test]
    fn rejects_mixed_families() {
        let mut cfg = Configuration::new("127.0.0.1:4500".parse().unwrap());
        cfg.accept_address = Some("[::1]:4501".parse().unwrap());
        assert!(cfg.prepare().is_err());
    }

    #[test]
    fn gateway_detection() {
        let mut cfg = Configuration::new("127.0.0.1:4500".parse().unwrap());
        assert!(!cfg.is_gateway());
        cfg.relay_gateways.push("10.0.0.1:4500".parse().unwrap());
        assert!(cfg.is_gateway());
    }
}
