//! Gateway forwarding for relayed sessions.
//!
//! A process with `relay_gateways` configured forwards traffic between
//! networks. Each relayed session occupies one forwarding slot, created by
//! the first Connect that crosses the gateway; retransmitted Connects find
//! the existing slot instead of allocating another.
//!
//! Tag translation: the initiating side stamps its own token on packets,
//! the accepting side stamps the slot tag it learned from the forwarded
//! Connect. The node routes on `(source address, incoming tag)` and
//! rewrites the tag to the one the other endpoint knows before forwarding.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::handshake::{AcceptData, ConnectData};
use crate::util::addr::BaseAddress;

/// Forwarding slots are dropped after this much inactivity.
const SLOT_EXPIRY: Duration = Duration::from_secs(5 * 60);

struct RelaySlot {
    /// Dedup key: the sender's base address and original token.
    origin: (BaseAddress, u32),
    sender_addr: SocketAddr,
    sender_token: u32,
    receiver_addr: SocketAddr,
    last_activity: Instant,
}

/// Where a forwarded datagram goes and which tag it must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forward {
    pub to: SocketAddr,
    pub relay_id: u32,
}

/// The gateway-side forwarding table.
pub struct Node {
    slots: Vec<Option<RelaySlot>>,
    free: Vec<u32>,
    /// `(sender base address, sender token)` -> slot, for Connect dedup.
    by_origin: HashMap<(BaseAddress, u32), u32>,
    /// `(endpoint address, tag the endpoint stamps)` -> slot.
    by_endpoint: HashMap<(SocketAddr, u32), u32>,
    capacity: usize,
}

impl Node {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_origin: HashMap::new(),
            by_endpoint: HashMap::new(),
            capacity,
        }
    }

    /// Number of live forwarding slots.
    pub fn slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Handle a Connect crossing this gateway. Returns the forward target
    /// and the rewritten Connect to send there, or `None` when the table
    /// is full or the payload is not forwardable.
    ///
    /// The rewritten Connect carries the slot tag as its relay id (the
    /// receiver adopts it) and the sender address actually observed.
    pub fn handle_connect(
        &mut self,
        src: SocketAddr,
        connect: &ConnectData,
        now: Instant,
    ) -> Option<(SocketAddr, ConnectData)> {
        let relay = connect.relay?;
        let origin = (BaseAddress::new(src.ip(), connect.base_port), connect.relay_id);

        let slot_idx = match self.by_origin.get(&origin) {
            Some(&idx) => {
                // retransmitted connect: reuse the slot
                let slot = self.slots[idx as usize].as_mut()?;
                slot.last_activity = now;
                trace!(slot = idx, "connect reuses forwarding slot");
                idx
            }
            None => {
                let idx = match self.free.pop() {
                    Some(idx) => idx,
                    None if self.slots.len() < self.capacity => {
                        self.slots.push(None);
                        (self.slots.len() - 1) as u32
                    }
                    None => {
                        debug!("forwarding table full, dropping connect");
                        return None;
                    }
                };
                let tag = Self::slot_tag(idx);
                self.slots[idx as usize] = Some(RelaySlot {
                    origin,
                    sender_addr: src,
                    sender_token: connect.relay_id,
                    receiver_addr: relay.receiver_address,
                    last_activity: now,
                });
                self.by_origin.insert(origin, idx);
                self.by_endpoint.insert((src, connect.relay_id), idx);
                self.by_endpoint.insert((relay.receiver_address, tag), idx);
                debug!(slot = idx, sender = %src, receiver = %relay.receiver_address,
                       "forwarding slot allocated");
                idx
            }
        };

        let slot = self.slots[slot_idx as usize].as_ref()?;
        let mut forwarded = connect.clone();
        forwarded.relay_id = Self::slot_tag(slot_idx);
        if let Some(relay) = forwarded.relay.as_mut() {
            relay.sender_address = src;
        }
        Some((slot.receiver_addr, forwarded))
    }

    /// Handle an Accept flowing back through the gateway: route to the
    /// sender and restore the sender's own token.
    pub fn handle_accept(
        &mut self,
        src: SocketAddr,
        accept: &AcceptData,
        now: Instant,
    ) -> Option<(SocketAddr, AcceptData)> {
        let idx = *self.by_endpoint.get(&(src, accept.relay_id))?;
        let slot = self.slots[idx as usize].as_mut()?;
        slot.last_activity = now;
        let mut forwarded = *accept;
        forwarded.relay_id = slot.sender_token;
        Some((slot.sender_addr, forwarded))
    }

    /// Route a relayed sequenced packet (data or keep-alive). Returns the
    /// target and the tag to rewrite into the packet.
    pub fn route(&mut self, src: SocketAddr, relay_id: u32, now: Instant) -> Option<Forward> {
        let idx = *self.by_endpoint.get(&(src, relay_id))?;
        let slot = self.slots[idx as usize].as_mut()?;
        slot.last_activity = now;
        if src == slot.sender_addr && relay_id == slot.sender_token {
            Some(Forward {
                to: slot.receiver_addr,
                relay_id: Self::slot_tag(idx),
            })
        } else {
            Some(Forward {
                to: slot.sender_addr,
                relay_id: slot.sender_token,
            })
        }
    }

    /// Drop slots idle past the expiry horizon.
    pub fn expire(&mut self, now: Instant) {
        for idx in 0..self.slots.len() {
            let expired = self.slots[idx]
                .as_ref()
                .is_some_and(|s| now.duration_since(s.last_activity) >= SLOT_EXPIRY);
            if expired {
                let slot = self.slots[idx].take().expect("just checked");
                let tag = Self::slot_tag(idx as u32);
                self.by_origin.remove(&slot.origin);
                self.by_endpoint
                    .remove(&(slot.sender_addr, slot.sender_token));
                self.by_endpoint.remove(&(slot.receiver_addr, tag));
                self.free.push(idx as u32);
                debug!(slot = idx, "forwarding slot expired");
            }
        }
    }

    /// The tag the accepting side stamps: slot index offset so tag zero
    /// never appears on the wire.
    fn slot_tag(idx: u32) -> u32 {
        idx + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::handshake::{RelayData, Timestamp};

    fn connect(base_port: u16, token: u32, receiver: SocketAddr) -> ConnectData {
        ConnectData::relayed(
            base_port,
            Timestamp { secs: 1, nanos: 0 },
            token,
            RelayData {
                receiver_network_id: 2,
                receiver_address: receiver,
                sender_network_id: 1,
                sender_address: "0.0.0.0:0".parse().unwrap(),
            },
        )
    }

    #[test]
    fn connect_allocates_then_reuses_slot() {
        let mut node = Node::new(16);
        let now = Instant::now();
        let sender: SocketAddr = "10.0.1.5:4500".parse().unwrap();
        let receiver: SocketAddr = "10.0.2.9:4500".parse().unwrap();
        let cd = connect(4500, 77, receiver);

        let (to, fwd) = node.handle_connect(sender, &cd, now).unwrap();
        assert_eq!(to, receiver);
        assert_eq!(fwd.relay_id, 1);
        assert_eq!(fwd.relay.unwrap().sender_address, sender);
        assert_eq!(node.slot_count(), 1);

        // a retransmitted connect must not allocate a second slot
        let (to2, fwd2) = node.handle_connect(sender, &cd, now).unwrap();
        assert_eq!(to2, receiver);
        assert_eq!(fwd2.relay_id, fwd.relay_id);
        assert_eq!(node.slot_count(), 1);
    }

    #[test]
    fn accept_routes_back_with_sender_token() {
        let mut node = Node::new(16);
        let now = Instant::now();
        let sender: SocketAddr = "10.0.1.5:4500".parse().unwrap();
        let receiver: SocketAddr = "10.0.2.9:4500".parse().unwrap();
        let (_, fwd) = node
            .handle_connect(sender, &connect(4500, 77, receiver), now)
            .unwrap();

        let accept = AcceptData {
            flags: 0,
            base_port: 4500,
            timestamp: Timestamp { secs: 1, nanos: 0 },
            relay_id: fwd.relay_id,
        };
        let (to, fwd_accept) = node.handle_accept(receiver, &accept, now).unwrap();
        assert_eq!(to, sender);
        assert_eq!(fwd_accept.relay_id, 77);
    }

    #[test]
    fn data_routes_both_directions() {
        let mut node = Node::new(16);
        let now = Instant::now();
        let sender: SocketAddr = "10.0.1.5:4500".parse().unwrap();
        let receiver: SocketAddr = "10.0.2.9:4500".parse().unwrap();
        let (_, fwd) = node
            .handle_connect(sender, &connect(4500, 77, receiver), now)
            .unwrap();

        let toward_receiver = node.route(sender, 77, now).unwrap();
        assert_eq!(toward_receiver.to, receiver);
        assert_eq!(toward_receiver.relay_id, fwd.relay_id);

        let toward_sender = node.route(receiver, fwd.relay_id, now).unwrap();
        assert_eq!(toward_sender.to, sender);
        assert_eq!(toward_sender.relay_id, 77);

        assert!(node.route(sender, 99, now).is_none());
    }

    #[test]
    fn idle_slots_expire() {
        let mut node = Node::new(16);
        let now = Instant::now();
        let sender: SocketAddr = "10.0.1.5:4500".parse().unwrap();
        let receiver: SocketAddr = "10.0.2.9:4500".parse().unwrap();
        node.handle_connect(sender, &connect(4500, 77, receiver), now)
            .unwrap();
        assert_eq!(node.slot_count(), 1);

        node.expire(now + SLOT_EXPIRY);
        assert_eq!(node.slot_count(), 0);
        assert!(node.route(sender, 77, now).is_none());
    }
}
