//! Wire packets: framing, identifier sequencing, update vectors and the
//! message-fragment records carried in the data area.
//!
//! Layout, little-endian on the wire:
//!
//! ```text
//! base header (4 bytes):  type:u8  flags:u8  size:u16
//! sequenced packets continue with:  id:u32
//!   relayed flag set:               relay_id:u32  network_id:u32
//!   update vector:                  count:u8  count x id:u32
//!   data area (Data only):          fragment records
//! control packets (Connect/Accept/Error) carry their payload verbatim.
//! ```
//!
//! `size` counts everything after the base header; its seventeenth bit
//! lives in the flags byte so a logical packet may exceed 64 KiB.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::little_endian::U16 as LeU16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::error::{Error, Result};

/// Fixed capacity of a wire packet.
pub const PACKET_CAPACITY: usize = 4096;

/// Size of the base header.
pub const BASE_HEADER_SIZE: usize = 4;

/// Largest sequence id; ids wrap past it. One less than a power of two so
/// the wrap-safe ordering below reduces to a mask.
pub const LAST_PACKET_ID: u32 = (1 << 30) - 1;

/// Id of a packet that only carries acknowledgements; never sequenced,
/// never acknowledged itself.
pub const UPDATE_PACKET_ID: u32 = u32::MAX;

/// Most acknowledged ids piggy-backed onto one outgoing packet.
pub const MAX_UPDATE_COUNT: usize = 8;

/// High bit of the logical size.
pub const FLAG_SIZE_64KB: u8 = 1;
/// The data area is compressed.
pub const FLAG_COMPRESSED: u8 = 2;
/// The packet travels through a relay gateway and carries routing fields.
pub const FLAG_RELAYED: u8 = 4;

/// Fragment record markers in the data area. `START` records carry a
/// [`MessageHead`]; `END` completes the message stream; `CANCEL` clears
/// partial peer state.
pub const RECORD_START: u8 = 0x1;
pub const RECORD_END: u8 = 0x2;
pub const RECORD_CANCEL: u8 = 0x4;

/// Packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 1,
    Connect = 2,
    Accept = 3,
    Error = 4,
    KeepAlive = 5,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Data),
            2 => Some(Self::Connect),
            3 => Some(Self::Accept),
            4 => Some(Self::Error),
            5 => Some(Self::KeepAlive),
            _ => None,
        }
    }

    /// Sequenced packets carry an id and an update vector. Handshake
    /// packets are sequenced so acknowledgement and retransmission share
    /// one mechanism; only Error packets are fire-and-forget.
    pub fn is_sequenced(self) -> bool {
        !matches!(self, Self::Error)
    }
}

/// Wrap-safe strict ordering of packet ids: true when `a` precedes `b`
/// within half the id space.
pub fn id_less(a: u32, b: u32) -> bool {
    a != b && (a.wrapping_sub(b) & LAST_PACKET_ID) > (LAST_PACKET_ID + 1) / 2
}

/// Successor of a packet id, wrapping at [`LAST_PACKET_ID`].
pub fn id_next(id: u32) -> u32 {
    if id == LAST_PACKET_ID { 0 } else { id + 1 }
}

/// Wrap-safe forward distance from `from` to `to`.
pub fn id_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from) & LAST_PACKET_ID
}

/// Rewrite the relay id of a relayed sequenced packet in place. Gateways
/// use this to swap the tag each endpoint knows for the one the other
/// endpoint knows.
pub fn rewrite_relay_id(datagram: &mut [u8], relay_id: u32) -> Result<()> {
    let header = BaseHeader::parse(datagram)?;
    let ptype = PacketType::from_u8(header.ptype)
        .ok_or_else(|| Error::InvalidPacket(format!("unknown type {}", header.ptype)))?;
    if !ptype.is_sequenced() || header.flags & FLAG_RELAYED == 0 {
        return Err(Error::InvalidPacket("packet carries no relay fields".into()));
    }
    let offset = BASE_HEADER_SIZE + 4;
    if datagram.len() < offset + 4 {
        return Err(Error::Truncated {
            expected: offset + 4,
            actual: datagram.len(),
        });
    }
    datagram[offset..offset + 4].copy_from_slice(&relay_id.to_le_bytes());
    Ok(())
}

/// The packet base header (mirrors the on-wire layout).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BaseHeader {
    /// Packet type discriminant.
    pub ptype: u8,
    /// Flag bits; bit 0 extends `size`.
    pub flags: u8,
    /// Low sixteen bits of the byte count following the header.
    pub size: LeU16,
}

impl BaseHeader {
    pub fn new(ptype: PacketType, flags: u8) -> Self {
        Self {
            ptype: ptype as u8,
            flags,
            size: LeU16::new(0),
        }
    }

    /// Logical size of everything after the base header.
    pub fn logical_size(&self) -> usize {
        let high = (self.flags & FLAG_SIZE_64KB) as usize;
        (high << 16) | self.size.get() as usize
    }

    pub fn set_logical_size(&mut self, size: usize) {
        self.size = LeU16::new((size & 0xffff) as u16);
        self.flags = (self.flags & !FLAG_SIZE_64KB) | (((size >> 16) & 1) as u8);
    }

    pub fn parse(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(h, _)| h)
            .map_err(|_| Error::Truncated {
                expected: BASE_HEADER_SIZE,
                actual: data.len(),
            })
    }
}

/// Relay routing fields on packets crossing a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayInfo {
    /// Gateway-local session tag.
    pub relay_id: u32,
    /// Network the packet is destined for.
    pub network_id: u32,
}

/// Per-message metadata carried by the first fragment of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHead {
    /// Serialization type id resolved through the protocol map.
    pub type_id: u32,
    /// Wire-visible message flags.
    pub flags: u32,
    /// Correlation index: the sender's stub index for requests, the echoed
    /// request index for responses.
    pub request_index: u32,
    /// Unique counter defeating stale correlation.
    pub request_unique: u32,
}

impl MessageHead {
    pub const SIZE: usize = 16;

    fn store(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.type_id);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.request_index);
        buf.put_u32_le(self.request_unique);
    }

    fn load(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Truncated {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            type_id: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            request_index: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            request_unique: u32::from_le_bytes(data[12..16].try_into().unwrap()),
        })
    }
}

/// A finished outbound packet, kept verbatim for retransmission.
#[derive(Debug, Clone)]
pub struct Packet {
    bytes: Bytes,
    id: u32,
    ptype: PacketType,
}

impl Packet {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn packet_type(&self) -> PacketType {
        self.ptype
    }
}

/// Handle to an open fragment record inside a [`PacketWriter`], used to
/// patch the marker byte once the serializer reports completion.
#[derive(Debug, Clone, Copy)]
pub struct FragmentMark {
    cmd_offset: usize,
}

/// Incremental builder for one wire packet.
pub struct PacketWriter {
    buf: BytesMut,
    data_start: usize,
    fragments: u16,
}

impl PacketWriter {
    /// Start a sequenced packet, draining up to [`MAX_UPDATE_COUNT`]
    /// acknowledgements from `updates`.
    pub fn sequenced(
        ptype: PacketType,
        id: u32,
        relay: Option<RelayInfo>,
        updates: &mut std::collections::VecDeque<u32>,
    ) -> Self {
        debug_assert!(ptype.is_sequenced());
        let mut flags = 0;
        if relay.is_some() {
            flags |= FLAG_RELAYED;
        }
        let mut buf = BytesMut::with_capacity(PACKET_CAPACITY);
        buf.extend_from_slice(BaseHeader::new(ptype, flags).as_bytes());
        buf.put_u32_le(id);
        if let Some(relay) = relay {
            buf.put_u32_le(relay.relay_id);
            buf.put_u32_le(relay.network_id);
        }
        let count = updates.len().min(MAX_UPDATE_COUNT);
        buf.put_u8(count as u8);
        for _ in 0..count {
            buf.put_u32_le(updates.pop_front().unwrap());
        }
        let data_start = buf.len();
        Self {
            buf,
            data_start,
            fragments: 0,
        }
    }

    /// Build a finished sequenced packet around a ready payload
    /// (Connect/Accept); updates piggy-back as on data packets.
    pub fn sequenced_control(
        ptype: PacketType,
        id: u32,
        relay: Option<RelayInfo>,
        updates: &mut std::collections::VecDeque<u32>,
        payload: &[u8],
    ) -> Packet {
        let mut writer = Self::sequenced(ptype, id, relay, updates);
        writer.buf.extend_from_slice(payload);
        writer.finish()
    }

    /// Build a finished unsequenced control packet (Error) around a ready
    /// payload.
    pub fn control(ptype: PacketType, payload: &[u8]) -> Packet {
        let mut buf = BytesMut::with_capacity(BASE_HEADER_SIZE + payload.len());
        let mut header = BaseHeader::new(ptype, 0);
        header.set_logical_size(payload.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(payload);
        Packet {
            bytes: buf.freeze(),
            id: 0,
            ptype,
        }
    }

    /// Bytes still available for fragment records.
    pub fn remaining(&self) -> usize {
        PACKET_CAPACITY - self.buf.len()
    }

    /// Bytes of data area written so far.
    pub fn data_len(&self) -> usize {
        self.buf.len() - self.data_start
    }

    /// Fragment records written so far.
    pub fn fragment_count(&self) -> u16 {
        self.fragments
    }

    /// Append one fragment record for `msg_idx`. `head` is present on the
    /// first fragment of a message. `fill` writes serialized bytes into the
    /// window it is given and returns how many it produced.
    ///
    /// Returns the record handle and the byte count, or `None` when the
    /// packet lacks room for a useful record.
    pub fn push_fragment(
        &mut self,
        msg_idx: u16,
        head: Option<&MessageHead>,
        fill: impl FnOnce(&mut [u8]) -> Result<usize>,
    ) -> Result<Option<(FragmentMark, usize)>> {
        let head_len = if head.is_some() { MessageHead::SIZE } else { 0 };
        // cmd + msg_idx + len
        let overhead = 1 + 2 + 2 + head_len;
        if self.remaining() < overhead + 1 {
            return Ok(None);
        }
        let cmd_offset = self.buf.len();
        self.buf
            .put_u8(if head.is_some() { RECORD_START } else { 0 });
        self.buf.put_u16_le(msg_idx);
        if let Some(head) = head {
            head.store(&mut self.buf);
        }
        let len_offset = self.buf.len();
        self.buf.put_u16_le(0);

        let window = self.remaining().min(u16::MAX as usize);
        let payload_offset = self.buf.len();
        self.buf.resize(payload_offset + window, 0);
        let written = match fill(&mut self.buf[payload_offset..payload_offset + window]) {
            Ok(n) => n,
            Err(e) => {
                self.buf.truncate(cmd_offset);
                return Err(e);
            }
        };
        debug_assert!(written <= window);
        self.buf.truncate(payload_offset + written);
        let len = (written as u16).to_le_bytes();
        self.buf[len_offset..len_offset + 2].copy_from_slice(&len);
        self.fragments += 1;
        Ok(Some((FragmentMark { cmd_offset }, written)))
    }

    /// Mark a previously written fragment as the final one of its message.
    pub fn mark_end(&mut self, mark: FragmentMark) {
        self.buf[mark.cmd_offset] |= RECORD_END;
    }

    /// Append a cancel record for `msg_idx`.
    pub fn push_cancel(&mut self, msg_idx: u16) -> bool {
        if self.remaining() < 3 {
            return false;
        }
        self.buf.put_u8(RECORD_CANCEL);
        self.buf.put_u16_le(msg_idx);
        self.fragments += 1;
        true
    }

    /// Offer the data area to a compression hook; when the hook produces a
    /// strictly smaller buffer the payload is swapped and the compressed
    /// flag set.
    pub fn try_compress(&mut self, compress: impl FnOnce(&[u8], &mut [u8]) -> Option<usize>) {
        let data_len = self.data_len();
        if data_len == 0 {
            return;
        }
        let mut scratch = vec![0u8; data_len];
        let Some(n) = compress(&self.buf[self.data_start..], &mut scratch) else {
            return;
        };
        if n >= data_len {
            return;
        }
        self.buf.truncate(self.data_start);
        self.buf.extend_from_slice(&scratch[..n]);
        self.buf[1] |= FLAG_COMPRESSED;
    }

    /// Patch the size field and freeze the packet.
    pub fn finish(mut self) -> Packet {
        let id = u32::from_le_bytes(
            self.buf[BASE_HEADER_SIZE..BASE_HEADER_SIZE + 4]
                .try_into()
                .unwrap(),
        );
        let ptype = PacketType::from_u8(self.buf[0]).expect("writer owns the type byte");
        let size = self.buf.len() - BASE_HEADER_SIZE;
        let size_low = ((size & 0xffff) as u16).to_le_bytes();
        self.buf[1] = (self.buf[1] & !FLAG_SIZE_64KB) | (((size >> 16) & 1) as u8);
        self.buf[2..4].copy_from_slice(&size_low);
        Packet {
            bytes: self.buf.freeze(),
            id,
            ptype,
        }
    }
}

/// A parsed inbound packet. Owns its bytes so out-of-order packets can be
/// buffered as received.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub ptype: PacketType,
    pub flags: u8,
    pub id: u32,
    pub relay: Option<RelayInfo>,
    pub updates: Vec<u32>,
    data: Bytes,
}

impl InboundPacket {
    /// Parse a datagram. Control packets keep their payload opaque in
    /// `data`; sequenced packets are split into id, updates and data area.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        let header = BaseHeader::parse(datagram)?;
        let ptype = PacketType::from_u8(header.ptype)
            .ok_or_else(|| Error::InvalidPacket(format!("unknown type {}", header.ptype)))?;
        let logical = header.logical_size();
        let body = &datagram[BASE_HEADER_SIZE..];
        if body.len() < logical {
            return Err(Error::Truncated {
                expected: logical,
                actual: body.len(),
            });
        }
        let body = &body[..logical];

        if !ptype.is_sequenced() {
            return Ok(Self {
                ptype,
                flags: header.flags,
                id: 0,
                relay: None,
                updates: Vec::new(),
                data: Bytes::copy_from_slice(body),
            });
        }

        let mut pos = 0usize;
        let need = |pos: usize, n: usize, len: usize| -> Result<()> {
            if pos + n > len {
                Err(Error::Truncated {
                    expected: pos + n,
                    actual: len,
                })
            } else {
                Ok(())
            }
        };

        need(pos, 4, body.len())?;
        let id = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
        pos += 4;

        let relay = if header.flags & FLAG_RELAYED != 0 {
            need(pos, 8, body.len())?;
            let relay_id = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
            let network_id = u32::from_le_bytes(body[pos + 4..pos + 8].try_into().unwrap());
            pos += 8;
            Some(RelayInfo {
                relay_id,
                network_id,
            })
        } else {
            None
        };

        need(pos, 1, body.len())?;
        let count = body[pos] as usize;
        pos += 1;
        if count > MAX_UPDATE_COUNT {
            return Err(Error::InvalidPacket(format!(
                "update count {count} exceeds {MAX_UPDATE_COUNT}"
            )));
        }
        need(pos, count * 4, body.len())?;
        let mut updates = Vec::with_capacity(count);
        for _ in 0..count {
            updates.push(u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()));
            pos += 4;
        }

        Ok(Self {
            ptype,
            flags: header.flags,
            id,
            relay,
            updates,
            data: Bytes::copy_from_slice(&body[pos..]),
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// The data area (or control payload) bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// One fragment record from a packet data area.
#[derive(Debug)]
pub struct Fragment<'a> {
    pub msg_idx: u16,
    pub is_start: bool,
    pub is_end: bool,
    pub is_cancel: bool,
    pub head: Option<MessageHead>,
    pub payload: &'a [u8],
}

/// Iterator over the fragment records of a data area.
pub struct FragmentIter<'a> {
    data: &'a [u8],
}

impl<'a> FragmentIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for FragmentIter<'a> {
    type Item = Result<Fragment<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < 3 {
            let err = Error::Truncated {
                expected: 3,
                actual: self.data.len(),
            };
            self.data = &[];
            return Some(Err(err));
        }
        let cmd = self.data[0];
        let msg_idx = u16::from_le_bytes(self.data[1..3].try_into().unwrap());
        let mut pos = 3usize;

        if cmd & RECORD_CANCEL != 0 {
            self.data = &self.data[pos..];
            return Some(Ok(Fragment {
                msg_idx,
                is_start: false,
                is_end: false,
                is_cancel: true,
                head: None,
                payload: &[],
            }));
        }

        let head = if cmd & RECORD_START != 0 {
            match MessageHead::load(&self.data[pos..]) {
                Ok(h) => {
                    pos += MessageHead::SIZE;
                    Some(h)
                }
                Err(e) => {
                    self.data = &[];
                    return Some(Err(e));
                }
            }
        } else {
            None
        };

        if self.data.len() < pos + 2 {
            let err = Error::Truncated {
                expected: pos + 2,
                actual: self.data.len(),
            };
            self.data = &[];
            return Some(Err(err));
        }
        let len = u16::from_le_bytes(self.data[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        if self.data.len() < pos + len {
            let err = Error::Truncated {
                expected: pos + len,
                actual: self.data.len(),
            };
            self.data = &[];
            return Some(Err(err));
        }
        let payload = &self.data[pos..pos + len];
        self.data = &self.data[pos + len..];
        Some(Ok(Fragment {
            msg_idx,
            is_start: cmd & RECORD_START != 0,
            is_end: cmd & RECORD_END != 0,
            is_cancel: false,
            head,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn id_ordering_wraps() {
        assert!(id_less(5, 6));
        assert!(!id_less(6, 5));
        assert!(!id_less(6, 6));
        // across the wrap point
        assert!(id_less(LAST_PACKET_ID, 0));
        assert!(id_less(LAST_PACKET_ID - 1, 2));
        assert!(!id_less(2, LAST_PACKET_ID));
    }

    #[test]
    fn id_next_wraps_to_zero() {
        assert_eq!(id_next(7), 8);
        assert_eq!(id_next(LAST_PACKET_ID), 0);
    }

    #[test]
    fn base_header_roundtrip() {
        let mut h = BaseHeader::new(PacketType::Data, 0);
        h.set_logical_size(70_000);
        let parsed = BaseHeader::parse(h.as_bytes()).unwrap();
        assert_eq!(parsed.logical_size(), 70_000);
        assert!(parsed.flags & FLAG_SIZE_64KB != 0);
    }

    #[test]
    fn sequenced_roundtrip_with_updates() {
        let mut updates: VecDeque<u32> = (10..20).collect();
        let mut w = PacketWriter::sequenced(PacketType::Data, 42, None, &mut updates);
        // only MAX_UPDATE_COUNT drained
        assert_eq!(updates.len(), 10 - MAX_UPDATE_COUNT);

        let head = MessageHead {
            type_id: 7,
            flags: 0,
            request_index: u32::MAX,
            request_unique: 0,
        };
        let (mark, n) = w
            .push_fragment(3, Some(&head), |buf| {
                buf[..5].copy_from_slice(b"hello");
                Ok(5)
            })
            .unwrap()
            .unwrap();
        assert_eq!(n, 5);
        w.mark_end(mark);
        let pkt = w.finish();
        assert_eq!(pkt.id(), 42);

        let inbound = InboundPacket::parse(pkt.bytes()).unwrap();
        assert_eq!(inbound.id, 42);
        assert_eq!(inbound.updates, (10..10 + MAX_UPDATE_COUNT as u32).collect::<Vec<_>>());

        let frags: Vec<_> = FragmentIter::new(inbound.data())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(frags.len(), 1);
        assert!(frags[0].is_start && frags[0].is_end);
        assert_eq!(frags[0].head.unwrap(), head);
        assert_eq!(frags[0].payload, b"hello");
    }

    #[test]
    fn relayed_fields_roundtrip() {
        let mut updates = VecDeque::new();
        let relay = RelayInfo {
            relay_id: 99,
            network_id: 2,
        };
        let w = PacketWriter::sequenced(PacketType::KeepAlive, 3, Some(relay), &mut updates);
        let pkt = w.finish();
        let inbound = InboundPacket::parse(pkt.bytes()).unwrap();
        assert_eq!(inbound.relay, Some(relay));
        assert_eq!(inbound.ptype, PacketType::KeepAlive);
        assert!(inbound.data().is_empty());
    }

    #[test]
    fn cancel_record_roundtrip() {
        let mut updates = VecDeque::new();
        let mut w = PacketWriter::sequenced(PacketType::Data, 8, None, &mut updates);
        assert!(w.push_cancel(11));
        let pkt = w.finish();
        let inbound = InboundPacket::parse(pkt.bytes()).unwrap();
        let frags: Vec<_> = FragmentIter::new(inbound.data())
            .collect::<Result<_>>()
            .unwrap();
        assert!(frags[0].is_cancel);
        assert_eq!(frags[0].msg_idx, 11);
    }

    #[test]
    fn sequenced_control_carries_payload_and_updates() {
        let mut updates: VecDeque<u32> = VecDeque::from([1]);
        let pkt = PacketWriter::sequenced_control(
            PacketType::Accept,
            1,
            None,
            &mut updates,
            b"payload",
        );
        let inbound = InboundPacket::parse(pkt.bytes()).unwrap();
        assert_eq!(inbound.ptype, PacketType::Accept);
        assert_eq!(inbound.id, 1);
        assert_eq!(inbound.updates, vec![1]);
        assert_eq!(inbound.data(), b"payload");
    }

    #[test]
    fn relay_id_rewrite() {
        let mut updates = VecDeque::new();
        let relay = RelayInfo {
            relay_id: 7,
            network_id: 1,
        };
        let pkt = PacketWriter::sequenced(PacketType::Data, 5, Some(relay), &mut updates).finish();
        let mut bytes = pkt.bytes().to_vec();
        rewrite_relay_id(&mut bytes, 42).unwrap();
        let inbound = InboundPacket::parse(&bytes).unwrap();
        assert_eq!(inbound.relay.unwrap().relay_id, 42);
        assert_eq!(inbound.relay.unwrap().network_id, 1);

        // a direct packet has no relay fields to rewrite
        let pkt = PacketWriter::sequenced(PacketType::Data, 5, None, &mut updates).finish();
        let mut bytes = pkt.bytes().to_vec();
        assert!(rewrite_relay_id(&mut bytes, 42).is_err());
    }

    #[test]
    fn truncated_datagram_rejected() {
        let mut updates = VecDeque::new();
        let pkt = PacketWriter::sequenced(PacketType::Data, 1, None, &mut updates).finish();
        let bytes = pkt.bytes();
        assert!(InboundPacket::parse(&bytes[..bytes.len() - 1]).is_err());
        assert!(InboundPacket::parse(&bytes[..2]).is_err());
    }

    #[test]
    fn compression_only_when_smaller() {
        let mut updates = VecDeque::new();
        let mut w = PacketWriter::sequenced(PacketType::Data, 1, None, &mut updates);
        w.push_fragment(0, None, |buf| {
            buf[..64].fill(b'a');
            Ok(64)
        })
        .unwrap()
        .unwrap();

        // hook declines
        w.try_compress(|_, _| None);
        let pkt = w.finish();
        let inbound = InboundPacket::parse(pkt.bytes()).unwrap();
        assert!(!inbound.is_compressed());
    }
}
