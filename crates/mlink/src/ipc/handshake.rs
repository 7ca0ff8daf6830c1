//! Connect/Accept/Error handshake payloads.
//!
//! A Connect opens a session; the Accept echoes the Connect's timestamp so
//! the initiator can detect that the peer restarted between the two. Relay
//! connects additionally carry the sender/receiver network ids and
//! addresses the gateway needs for its forwarding slot.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use winnow::Parser;
use winnow::binary::{le_u16, le_u32, u8 as any_u8};
use winnow::token::take;

use super::error::{Error, Result};

/// Magic bytes opening every Connect payload.
pub const CONNECT_MAGIC: &[u8; 5] = b"sfipc";

/// Protocol version spoken by this implementation.
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Connect payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectType {
    /// Same-network session.
    Basic = 1,
    /// Cross-network IPv4 session through a gateway.
    Relay4 = 2,
    /// Cross-network IPv6 session through a gateway.
    Relay6 = 3,
}

impl ConnectType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Basic),
            2 => Some(Self::Relay4),
            3 => Some(Self::Relay6),
            _ => None,
        }
    }
}

/// Wall-clock instant captured at service startup and echoed through the
/// handshake. A mismatch on Accept means the peer observed a previous
/// incarnation of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub secs: u32,
    pub nanos: u32,
}

impl Timestamp {
    /// Capture the current wall clock.
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: elapsed.as_secs() as u32,
            nanos: elapsed.subsec_nanos(),
        }
    }
}

/// Relay addressing block of a Connect payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayData {
    pub receiver_network_id: u32,
    pub receiver_address: SocketAddr,
    pub sender_network_id: u32,
    pub sender_address: SocketAddr,
}

/// Connect packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectData {
    pub kind: ConnectType,
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u16,
    /// Sender's listening port; together with the datagram source IP it
    /// forms the sender's base address.
    pub base_port: u16,
    pub timestamp: Timestamp,
    /// Sender-chosen tag disambiguating relayed sessions at the gateway.
    pub relay_id: u32,
    pub relay: Option<RelayData>,
}

impl ConnectData {
    /// A same-network connect.
    pub fn basic(base_port: u16, timestamp: Timestamp) -> Self {
        Self {
            kind: ConnectType::Basic,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            flags: 0,
            base_port,
            timestamp,
            relay_id: 0,
            relay: None,
        }
    }

    /// A cross-network connect through a gateway.
    pub fn relayed(base_port: u16, timestamp: Timestamp, relay_id: u32, relay: RelayData) -> Self {
        let kind = if relay.receiver_address.is_ipv4() {
            ConnectType::Relay4
        } else {
            ConnectType::Relay6
        };
        Self {
            kind,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            flags: 0,
            base_port,
            timestamp,
            relay_id,
            relay: Some(relay),
        }
    }

    /// True when the peer's version is one we can talk to.
    pub fn version_supported(&self) -> bool {
        self.version_major == VERSION_MAJOR
    }

    pub fn store(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(CONNECT_MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_u16_le(self.version_major);
        buf.put_u16_le(self.version_minor);
        buf.put_u16_le(self.flags);
        buf.put_u16_le(self.base_port);
        buf.put_u32_le(self.timestamp.secs);
        buf.put_u32_le(self.timestamp.nanos);
        buf.put_u32_le(self.relay_id);
        if let Some(relay) = &self.relay {
            buf.put_u32_le(relay.receiver_network_id);
            store_addr(&mut buf, relay.receiver_address);
            buf.put_u32_le(relay.sender_network_id);
            store_addr(&mut buf, relay.sender_address);
        }
        buf
    }

    pub fn load(payload: &[u8]) -> Result<Self> {
        parse_connect
            .parse(payload)
            .map_err(|e| Error::InvalidPacket(format!("connect payload: {e}")))
    }
}

/// Accept packet payload. The timestamp is the one received in the
/// Connect, echoed back; `relay_id` echoes the Connect's relay id so the
/// gateway can route the Accept to its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptData {
    pub flags: u16,
    pub base_port: u16,
    pub timestamp: Timestamp,
    pub relay_id: u32,
}

impl AcceptData {
    pub const SIZE: usize = 2 + 2 + 4 + 4 + 4;

    pub fn store(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u16_le(self.flags);
        buf.put_u16_le(self.base_port);
        buf.put_u32_le(self.timestamp.secs);
        buf.put_u32_le(self.timestamp.nanos);
        buf.put_u32_le(self.relay_id);
        buf
    }

    pub fn load(payload: &[u8]) -> Result<Self> {
        parse_accept
            .parse(payload)
            .map_err(|e| Error::InvalidPacket(format!("accept payload: {e}")))
    }
}

/// Error packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorData {
    pub code: u32,
}

impl ErrorData {
    /// Peer speaks an unsupported version.
    pub const BAD_VERSION: u32 = 1;
    /// Datagram addressed to no live session.
    pub const NO_SESSION: u32 = 2;
    /// Authentication was refused.
    pub const AUTH_REFUSED: u32 = 3;

    pub fn store(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(self.code);
        buf
    }

    pub fn load(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::Truncated {
                expected: 4,
                actual: payload.len(),
            });
        }
        Ok(Self {
            code: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
        })
    }
}

fn store_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_u16_le(addr.port());
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_u16_le(addr.port());
            buf.extend_from_slice(&ip.octets());
        }
    }
}

type PResult<T> = winnow::ModalResult<T>;

fn parse_addr(input: &mut &[u8]) -> PResult<SocketAddr> {
    let family = any_u8.parse_next(input)?;
    let port = le_u16.parse_next(input)?;
    match family {
        4 => {
            let octets: [u8; 4] = take(4usize)
                .parse_next(input)?
                .try_into()
                .expect("take(4) yields 4 bytes");
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        6 => {
            let octets: [u8; 16] = take(16usize)
                .parse_next(input)?
                .try_into()
                .expect("take(16) yields 16 bytes");
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(winnow::error::ErrMode::Cut(
            winnow::error::ContextError::new(),
        )),
    }
}

fn parse_timestamp(input: &mut &[u8]) -> PResult<Timestamp> {
    let secs = le_u32.parse_next(input)?;
    let nanos = le_u32.parse_next(input)?;
    Ok(Timestamp { secs, nanos })
}

fn parse_connect(input: &mut &[u8]) -> PResult<ConnectData> {
    let _ = winnow::token::literal(&CONNECT_MAGIC[..]).parse_next(input)?;
    let kind_raw = any_u8.parse_next(input)?;
    let kind = ConnectType::from_u8(kind_raw).ok_or_else(|| {
        winnow::error::ErrMode::Cut(winnow::error::ContextError::new())
    })?;
    let version_major = le_u16.parse_next(input)?;
    let version_minor = le_u16.parse_next(input)?;
    let flags = le_u16.parse_next(input)?;
    let base_port = le_u16.parse_next(input)?;
    let timestamp = parse_timestamp.parse_next(input)?;
    let relay_id = le_u32.parse_next(input)?;

    let relay = if kind != ConnectType::Basic {
        let receiver_network_id = le_u32.parse_next(input)?;
        let receiver_address = parse_addr.parse_next(input)?;
        let sender_network_id = le_u32.parse_next(input)?;
        let sender_address = parse_addr.parse_next(input)?;
        Some(RelayData {
            receiver_network_id,
            receiver_address,
            sender_network_id,
            sender_address,
        })
    } else {
        None
    };

    Ok(ConnectData {
        kind,
        version_major,
        version_minor,
        flags,
        base_port,
        timestamp,
        relay_id,
        relay,
    })
}

fn parse_accept(input: &mut &[u8]) -> PResult<AcceptData> {
    let flags = le_u16.parse_next(input)?;
    let base_port = le_u16.parse_next(input)?;
    let timestamp = parse_timestamp.parse_next(input)?;
    let relay_id = le_u32.parse_next(input)?;
    Ok(AcceptData {
        flags,
        base_port,
        timestamp,
        relay_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_connect_roundtrip() {
        let data = ConnectData::basic(4500, Timestamp { secs: 77, nanos: 3 });
        let bytes = data.store();
        let parsed = ConnectData::load(&bytes).unwrap();
        assert_eq!(parsed, data);
        assert!(parsed.version_supported());
    }

    #[test]
    fn relayed_connect_roundtrip() {
        let relay = RelayData {
            receiver_network_id: 2,
            receiver_address: "10.0.0.9:4500".parse().unwrap(),
            sender_network_id: 1,
            sender_address: "192.168.0.4:4500".parse().unwrap(),
        };
        let data = ConnectData::relayed(4500, Timestamp::now(), 31, relay);
        let parsed = ConnectData::load(&data.store()).unwrap();
        assert_eq!(parsed.kind, ConnectType::Relay4);
        assert_eq!(parsed.relay, Some(relay));
        assert_eq!(parsed.relay_id, 31);
    }

    #[test]
    fn relayed_v6_connect_roundtrip() {
        let relay = RelayData {
            receiver_network_id: 5,
            receiver_address: "[2001:db8::1]:4500".parse().unwrap(),
            sender_network_id: 4,
            sender_address: "[2001:db8::2]:4500".parse().unwrap(),
        };
        let data = ConnectData::relayed(4500, Timestamp::now(), 8, relay);
        let parsed = ConnectData::load(&data.store()).unwrap();
        assert_eq!(parsed.kind, ConnectType::Relay6);
        assert_eq!(parsed.relay, Some(relay));
    }

    #[test]
    fn bad_magic_rejected() {
        let data = ConnectData::basic(4500, Timestamp::default());
        let mut bytes = data.store();
        bytes[0] = b'x';
        assert!(ConnectData::load(&bytes).is_err());
    }

    #[test]
    fn accept_roundtrip() {
        let data = AcceptData {
            flags: 0,
            base_port: 4500,
            timestamp: Timestamp {
                secs: 1234,
                nanos: 5678,
            },
            relay_id: 12,
        };
        let parsed = AcceptData::load(&data.store()).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn error_roundtrip() {
        let data = ErrorData {
            code: ErrorData::NO_SESSION,
        };
        assert_eq!(ErrorData::load(&data.store()).unwrap(), data);
    }
}
