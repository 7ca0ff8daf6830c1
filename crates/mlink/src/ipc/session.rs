//! The per-session protocol engine.
//!
//! A session turns an ordered stream of application message submissions
//! and a duplex sequence of datagrams into reliable, ordered, correlated
//! message delivery. It is a pure state machine: sockets and clocks belong
//! to the talker, which drives the session through a [`TalkerStub`] and
//! collects the datagrams and timer requests the session produces.
//!
//! The engine tracks three pools per session, each a vector with a
//! free-index stack: message stubs (one per live submission), send-packet
//! slots (one per unacknowledged packet, slot 0 reserved for keep-alive)
//! and receive slots (one per partially reassembled inbound message).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::config::Configuration;
use super::controller::{AuthResult, ConnectionContext, Controller};
use super::error::{CompletionStatus, Error, Result};
use super::handshake::{AcceptData, ConnectData, ErrorData, RelayData, Timestamp};
use super::packet::{
    FragmentIter, InboundPacket, MessageHead, Packet, PacketType, PacketWriter, RelayInfo,
    UPDATE_PACKET_ID, id_distance, id_less, id_next,
};
use super::protocol::{
    Deserializer, Message, MessageTypeId, MessageUid, Protocol, Serializer, flags,
};
use super::service::ConnectionUid;
use crate::util::addr::{BaseAddress, RelayAddress};

/// Packets buffered ahead of `rcv_expected_id`.
pub const MAX_OUT_OF_ORDER: usize = 4;

/// Retransmit backoff table, indexed by retransmit position.
const RETRANSMIT_TIMEOUTS_MS: &[u64] = &[
    100, 200, 400, 800, 1600, 3200, 6400, 12_800, 25_600, 51_200,
];

/// Every this many packet ids the retransmit position recalibrates toward
/// the front of the table.
const REFRESH_INDEX_MASK: u32 = (1 << 7) - 1;

/// Slow-start positions into the backoff table for handshake packets.
const CONNECT_RETRANSMIT_POS: u32 = 0;
const CONNECT_RETRANSMIT_POS_RELAY: u32 = 2;

fn retransmit_timeout(pos: u32) -> Duration {
    let idx = (pos as usize).min(RETRANSMIT_TIMEOUTS_MS.len() - 1);
    Duration::from_millis(RETRANSMIT_TIMEOUTS_MS[idx])
}

/// A datagram the session wants on the wire.
#[derive(Debug, Clone)]
pub struct Transmit {
    pub to: SocketAddr,
    pub bytes: Bytes,
}

/// A retransmit/keep-alive deadline the session asks to be called back
/// on. The `(slot, slot_unique)` pair makes stale timers harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub deadline: Instant,
    pub session_index: u16,
    pub slot: u8,
    pub slot_unique: u16,
}

/// The talker-side interface a session drives its I/O through.
///
/// The stub borrows the talker's outbound queue and timer list; a session
/// call either makes progress through it or returns with nothing queued.
pub struct TalkerStub<'a> {
    now: Instant,
    base_port: u16,
    session_index: u16,
    out: &'a mut VecDeque<Transmit>,
    timers: &'a mut Vec<TimerRequest>,
}

impl<'a> TalkerStub<'a> {
    pub fn new(
        now: Instant,
        base_port: u16,
        session_index: u16,
        out: &'a mut VecDeque<Transmit>,
        timers: &'a mut Vec<TimerRequest>,
    ) -> Self {
        Self {
            now,
            base_port,
            session_index,
            out,
            timers,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// The local listening port, advertised in handshakes.
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    fn push_send(&mut self, to: SocketAddr, bytes: Bytes) {
        self.out.push_back(Transmit { to, bytes });
    }

    fn push_timer(&mut self, deadline: Instant, slot: u8, slot_unique: u16) {
        self.timers.push(TimerRequest {
            deadline,
            session_index: self.session_index,
            slot,
            slot_unique,
        });
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    RelayConnecting,
    Accepting,
    RelayAccepting,
    WaitAccept,
    Authenticating,
    Connected,
    WaitDisconnecting,
    Disconnecting,
    Reconnecting,
    Disconnected,
}

impl State {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticating)
    }
}

/// Addressing kind of a session.
#[derive(Debug, Clone)]
enum Kind {
    /// Peer reachable directly; v4 or v6 decided by the address.
    Direct,
    /// Peer in another network, reached through a gateway.
    Relayed {
        /// The peer's real address, carried in the Connect.
        peer_address: SocketAddr,
        /// Network the peer lives in.
        network_id: u32,
        /// Relay tag this side stamps on sequenced packets.
        token: u32,
        /// Index into the configured gateway vector.
        crt_gw_idx: usize,
        /// One failover rotation is allowed per session.
        failover_used: bool,
    },
}

struct SendMessageStub {
    msg: Option<Arc<dyn Message>>,
    type_id: MessageTypeId,
    flags: u32,
    /// Correlation uid this message answers, for responses.
    request_uid: MessageUid,
    serializer: Option<Box<dyn Serializer>>,
    /// Demux index used on the wire while the message serializes.
    wire_idx: Option<u16>,
    unique: u32,
}

impl SendMessageStub {
    fn empty() -> Self {
        Self {
            msg: None,
            type_id: 0,
            flags: 0,
            request_uid: MessageUid::INVALID,
            serializer: None,
            wire_idx: None,
            unique: 0,
        }
    }

    fn is_free(&self) -> bool {
        self.msg.is_none()
    }
}

struct SendPacketSlot {
    packet: Option<Packet>,
    /// Messages whose serialization ended in this packet; completed when
    /// the packet is acknowledged.
    msg_indices: Vec<u32>,
    resend_count: u8,
    unique: u16,
}

impl SendPacketSlot {
    fn empty() -> Self {
        Self {
            packet: None,
            msg_indices: Vec::new(),
            resend_count: 0,
            unique: 0,
        }
    }
}

struct RecvSlot {
    deserializer: Box<dyn Deserializer>,
    head: MessageHead,
}

/// Shared handles every session needs.
#[derive(Clone)]
pub struct SessionShared {
    pub config: Arc<Configuration>,
    pub protocol: Arc<dyn Protocol>,
    pub controller: Arc<dyn Controller>,
    /// Service startup timestamp, echoed through handshakes.
    pub timestamp: Timestamp,
}

/// Outcome of one [`Session::execute`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Nothing left to do until a packet or timer arrives.
    Idle,
    /// The session is dead; the talker must drop it and unregister its
    /// address.
    Destroy,
}

/// The per-peer protocol state machine.
pub struct Session {
    shared: SessionShared,
    kind: Kind,
    state: State,
    uid: ConnectionUid,
    /// Where datagrams for this session go: the peer for direct sessions,
    /// the current gateway for relayed ones.
    pair_addr: SocketAddr,
    /// The peer's base (listening) port.
    peer_base_port: u16,
    /// Timestamp received in the peer's Connect, echoed in our Accept and
    /// compared on retransmitted Connects.
    peer_timestamp: Option<Timestamp>,
    /// Relay id of the peer, learned during the handshake.
    peer_relay_id: u32,

    rcv_expected_id: u32,
    send_id: u32,
    retransmit_time_pos: u32,
    sent_wait_response: u32,

    send_messages: Vec<SendMessageStub>,
    send_free: Vec<u32>,
    wire_free: Vec<u16>,

    send_slots: Vec<SendPacketSlot>,
    slot_free: Vec<u8>,

    /// Submitted messages waiting for room in the send queue.
    pending: VecDeque<u32>,
    /// Active multiplexed messages, round-robined into packets.
    send_queue: VecDeque<u32>,
    /// Index of the synchronous message currently serializing.
    current_send_sync: Option<u32>,
    /// Wire cancel records awaiting emission.
    cancel_queue: VecDeque<u16>,

    out_of_order: Vec<InboundPacket>,
    recv_slots: Vec<Option<RecvSlot>>,
    /// Received packet ids awaiting acknowledgement.
    rcvd_ids: VecDeque<u32>,

    last_recv_time: Instant,
    keepalive_armed: bool,
    dead: bool,
}

impl Session {
    fn base(
        shared: SessionShared,
        kind: Kind,
        state: State,
        pair_addr: SocketAddr,
        now: Instant,
    ) -> Self {
        let slot_count = shared.config.session.max_send_packet_count as usize + 1;
        let mut send_slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            send_slots.push(SendPacketSlot::empty());
        }
        // slot 0 is the keep-alive slot and never enters the free stack
        let slot_free: Vec<u8> = (1..slot_count as u8).rev().collect();
        let wire_free: Vec<u16> = (0..shared.config.session.max_send_message_queue_size as u16)
            .rev()
            .collect();
        let retransmit_time_pos = match kind {
            Kind::Relayed { .. } => CONNECT_RETRANSMIT_POS_RELAY,
            Kind::Direct => CONNECT_RETRANSMIT_POS,
        };
        Self {
            shared,
            kind,
            state,
            uid: ConnectionUid::INVALID,
            pair_addr,
            peer_base_port: pair_addr.port(),
            peer_timestamp: None,
            peer_relay_id: 0,
            rcv_expected_id: 2,
            send_id: 1,
            retransmit_time_pos,
            sent_wait_response: 0,
            send_messages: Vec::new(),
            send_free: Vec::new(),
            wire_free,
            send_slots,
            slot_free,
            pending: VecDeque::new(),
            send_queue: VecDeque::new(),
            current_send_sync: None,
            cancel_queue: VecDeque::new(),
            out_of_order: Vec::with_capacity(MAX_OUT_OF_ORDER),
            recv_slots: Vec::new(),
            rcvd_ids: VecDeque::new(),
            last_recv_time: now,
            keepalive_armed: false,
            dead: false,
        }
    }

    /// A session initiating a same-network handshake.
    pub fn connecting(peer: SocketAddr, shared: SessionShared, now: Instant) -> Self {
        Self::base(shared, Kind::Direct, State::Connecting, peer, now)
    }

    /// A session created from an inbound same-network Connect.
    pub fn accepting(
        src: SocketAddr,
        connect: &ConnectData,
        shared: SessionShared,
        now: Instant,
    ) -> Self {
        let mut s = Self::base(shared, Kind::Direct, State::Accepting, src, now);
        s.peer_base_port = connect.base_port;
        s.peer_timestamp = Some(connect.timestamp);
        s.peer_relay_id = connect.relay_id;
        s
    }

    /// A session initiating a cross-network handshake through a gateway.
    pub fn relay_connecting(
        peer: SocketAddr,
        network_id: u32,
        relay_token: u32,
        shared: SessionShared,
        now: Instant,
    ) -> Result<Self> {
        if shared.config.gateway_addresses.is_empty() {
            return Err(Error::NoGateway { network_id });
        }
        let crt_gw_idx = relay_token as usize % shared.config.gateway_addresses.len();
        let gateway = shared.config.gateway_addresses[crt_gw_idx];
        let kind = Kind::Relayed {
            peer_address: peer,
            network_id,
            token: relay_token,
            crt_gw_idx,
            failover_used: false,
        };
        let mut s = Self::base(shared, kind, State::RelayConnecting, gateway, now);
        s.peer_base_port = peer.port();
        Ok(s)
    }

    /// A session created from a forwarded cross-network Connect.
    pub fn relay_accepting(
        gateway: SocketAddr,
        connect: &ConnectData,
        shared: SessionShared,
        now: Instant,
    ) -> Result<Self> {
        let relay = connect
            .relay
            .ok_or_else(|| Error::InvalidPacket("relay connect without relay data".into()))?;
        let kind = Kind::Relayed {
            peer_address: relay.sender_address,
            network_id: relay.sender_network_id,
            // the forwarded relay id is the gateway slot tag; both sides
            // stamp the tag they learned during the handshake
            token: connect.relay_id,
            crt_gw_idx: 0,
            failover_used: false,
        };
        let mut s = Self::base(shared, kind, State::RelayAccepting, gateway, now);
        s.peer_base_port = connect.base_port;
        s.peer_timestamp = Some(connect.timestamp);
        s.peer_relay_id = connect.relay_id;
        Ok(s)
    }

    pub fn set_connection_uid(&mut self, uid: ConnectionUid) {
        self.uid = uid;
    }

    pub fn connection_uid(&self) -> ConnectionUid {
        self.uid
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// The address datagrams for this session are sent to.
    pub fn pair_address(&self) -> SocketAddr {
        self.pair_addr
    }

    /// The peer's base address, the session key.
    pub fn peer_base_address(&self) -> BaseAddress {
        match &self.kind {
            Kind::Direct => BaseAddress::new(self.pair_addr.ip(), self.peer_base_port),
            Kind::Relayed { peer_address, .. } => {
                BaseAddress::new(peer_address.ip(), self.peer_base_port)
            }
        }
    }

    /// The relay key for cross-network sessions.
    pub fn relay_address(&self) -> Option<RelayAddress> {
        match &self.kind {
            Kind::Direct => None,
            Kind::Relayed { network_id, .. } => {
                Some(RelayAddress::new(self.peer_base_address(), *network_id))
            }
        }
    }

    /// The relay tag this session stamps on sequenced packets, if any.
    pub fn relay_token(&self) -> Option<u32> {
        match &self.kind {
            Kind::Direct => None,
            Kind::Relayed { token, .. } => Some(*token),
        }
    }

    fn is_relayed(&self) -> bool {
        matches!(self.kind, Kind::Relayed { .. })
    }

    fn ctx(&self) -> ConnectionContext {
        ConnectionContext {
            connection: self.uid,
            peer_address: self.pair_addr,
            request_uid: MessageUid::INVALID,
        }
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Submit a message. `request_uid` carries the correlation uid when
    /// `flags::RESPONSE` is set.
    pub fn push_message(
        &mut self,
        msg: Arc<dyn Message>,
        type_id: MessageTypeId,
        msg_flags: u32,
        request_uid: MessageUid,
    ) -> Result<MessageUid> {
        if self.dead || matches!(self.state, State::Disconnecting | State::Disconnected) {
            return Err(Error::NoConnection);
        }
        let idx = match self.send_free.pop() {
            Some(idx) => idx,
            None => {
                self.send_messages.push(SendMessageStub::empty());
                (self.send_messages.len() - 1) as u32
            }
        };
        let stub = &mut self.send_messages[idx as usize];
        debug_assert!(stub.is_free());
        stub.msg = Some(msg);
        stub.type_id = type_id;
        stub.flags = msg_flags & flags::WIRE_MASK;
        stub.request_uid = request_uid;
        stub.serializer = None;
        stub.wire_idx = None;
        let uid = MessageUid::new(idx, stub.unique);
        self.pending.push_back(idx);
        trace!(msg = %uid, flags = msg_flags, "message queued");
        Ok(uid)
    }

    /// Cancel a submitted message. A no-op for unknown, completed or
    /// already-canceled uids.
    pub fn cancel_message(&mut self, uid: MessageUid) {
        let Some(stub) = self.send_messages.get_mut(uid.index as usize) else {
            return;
        };
        if stub.unique != uid.unique || stub.is_free() || stub.flags & flags::CANCELED != 0 {
            return;
        }
        stub.flags |= flags::CANCELED;
        stub.serializer = None;
        let was_counted = stub.flags & flags::WAIT_RESPONSE != 0 && stub.flags & flags::ACTIVE != 0;
        let started = stub.flags & flags::STARTED != 0;
        let wire_idx = if started { stub.wire_idx.take() } else { None };
        if was_counted {
            self.sent_wait_response = self.sent_wait_response.saturating_sub(1);
        }
        if let Some(wire_idx) = wire_idx {
            // the peer saw fragments; tell it to drop the partial state
            self.cancel_queue.push_back(wire_idx);
        }
        if self.current_send_sync == Some(uid.index) {
            self.current_send_sync = None;
        }
        debug!(msg = %uid, "message canceled");
        self.complete_message(uid.index, None, CompletionStatus::Canceled);
        // the queues drop freed indices lazily when they meet them
    }

    /// Ask the session to close once every queued message is flushed.
    pub fn disconnect(&mut self) {
        if self.pending.is_empty() && self.send_queue.is_empty() && self.all_slots_free() {
            self.state = State::Disconnecting;
        } else {
            self.state = State::WaitDisconnecting;
        }
    }

    fn all_slots_free(&self) -> bool {
        self.slot_free.len() == self.send_slots.len() - 1 && self.send_slots[0].packet.is_none()
    }

    /// Complete a message stub exactly once and recycle its slot.
    fn complete_message(
        &mut self,
        idx: u32,
        response: Option<Arc<dyn Message>>,
        status: CompletionStatus,
    ) {
        let ctx = self.ctx();
        let stub = &mut self.send_messages[idx as usize];
        let Some(msg) = stub.msg.take() else {
            return;
        };
        stub.serializer = None;
        stub.unique = stub.unique.wrapping_add(1);
        if let Some(wire_idx) = stub.wire_idx.take() {
            self.wire_free.push(wire_idx);
        }
        self.send_free.push(idx);
        self.shared
            .controller
            .on_complete(&ctx, msg, response, status);
    }

    /// Move pending messages into the active send queue while the
    /// multiplex limit allows, running the prepare hook on each. While
    /// authenticating only authentication messages leave the FIFO.
    fn move_pending_to_send_queue(&mut self) {
        let limit = self.shared.config.session.max_send_message_queue_size as usize;
        let auth_only = self.state == State::Authenticating;
        let ctx = self.ctx();
        let mut rescan = self.pending.len();
        while rescan > 0 && self.send_queue.len() < limit {
            rescan -= 1;
            let Some(idx) = self.pending.pop_front() else {
                break;
            };
            {
                let stub = &self.send_messages[idx as usize];
                if stub.is_free() || stub.flags & flags::CANCELED != 0 {
                    continue;
                }
                if auth_only && stub.flags & flags::AUTHENTICATION == 0 {
                    self.pending.push_back(idx);
                    continue;
                }
            }
            let Some(wire_idx) = self.wire_free.pop() else {
                self.pending.push_front(idx);
                break;
            };
            let stub = &mut self.send_messages[idx as usize];
            stub.wire_idx = Some(wire_idx);
            let extra = {
                let msg = stub.msg.as_ref().expect("stub is live");
                self.shared.controller.on_prepare(&ctx, msg.as_ref())
            };
            let stub = &mut self.send_messages[idx as usize];
            stub.flags |= (extra & flags::WIRE_MASK) | flags::ACTIVE;
            if stub.flags & flags::WAIT_RESPONSE != 0 {
                self.sent_wait_response += 1;
            }
            self.send_queue.push_back(idx);
        }
    }

    /// Pick the message the next fragment comes from, honoring the
    /// synchronous discipline: while a synchronous message serializes no
    /// other synchronous message may start, but asynchronous messages may
    /// interleave.
    fn pick_send_index(&mut self) -> Option<u32> {
        let qlen = self.send_queue.len();
        for _ in 0..=qlen {
            let idx = *self.send_queue.front()?;
            let stub = &self.send_messages[idx as usize];
            if stub.is_free() || stub.flags & flags::CANCELED != 0 {
                self.send_queue.pop_front();
                continue;
            }
            let is_sync = stub.flags & flags::SYNCHRONOUS != 0;
            match self.current_send_sync {
                Some(active) if is_sync && active != idx => {
                    // a different synchronous message owns the stream
                    self.send_queue.rotate_left(1);
                }
                _ => return Some(idx),
            }
        }
        None
    }

    /// Fill one data packet from the cancel queue and the send queue.
    /// Returns the stored packet when at least one record was produced.
    fn fill_data_packet(&mut self) -> Result<Option<u8>> {
        let relay = self.relay_info();
        let mut writer =
            PacketWriter::sequenced(PacketType::Data, self.send_id, relay, &mut self.rcvd_ids);
        let mut completed: Vec<u32> = Vec::new();
        let max_fragments = self.shared.config.session.max_message_packet_count;

        while let Some(&wire_idx) = self.cancel_queue.front() {
            if !writer.push_cancel(wire_idx) {
                break;
            }
            self.cancel_queue.pop_front();
            self.wire_free.push(wire_idx);
        }

        while writer.fragment_count() < max_fragments {
            let Some(idx) = self.pick_send_index() else {
                break;
            };
            let starting = self.send_messages[idx as usize].serializer.is_none();
            if starting {
                let stub = &mut self.send_messages[idx as usize];
                let msg = stub.msg.as_ref().expect("picked stub is live");
                stub.serializer = Some(self.shared.protocol.serializer(stub.type_id, msg)?);
                stub.flags |= flags::STARTED;
                if stub.flags & flags::SYNCHRONOUS != 0 {
                    self.current_send_sync = Some(idx);
                }
            }
            let stub = &mut self.send_messages[idx as usize];
            let head = if starting {
                let request = if stub.flags & flags::RESPONSE != 0 {
                    stub.request_uid
                } else if stub.flags & flags::WAIT_RESPONSE != 0 {
                    MessageUid::new(idx, stub.unique)
                } else {
                    MessageUid::INVALID
                };
                Some(MessageHead {
                    type_id: stub.type_id,
                    flags: stub.flags & flags::WIRE_MASK,
                    request_index: request.index,
                    request_unique: request.unique,
                })
            } else {
                None
            };
            let wire_idx = stub.wire_idx.expect("queued stub has a wire index");
            let serializer = stub.serializer.as_mut().expect("just ensured");
            let Some((mark, _written)) =
                writer.push_fragment(wire_idx, head.as_ref(), |buf| serializer.fill(buf))?
            else {
                break;
            };
            let stub = &mut self.send_messages[idx as usize];
            if stub.serializer.as_ref().is_some_and(|s| s.is_complete()) {
                writer.mark_end(mark);
                stub.serializer = None;
                if let Some(wire_idx) = stub.wire_idx.take() {
                    self.wire_free.push(wire_idx);
                }
                if self.current_send_sync == Some(idx) {
                    self.current_send_sync = None;
                }
                // completion waits for the acknowledgement of this packet
                completed.push(idx);
                if let Some(pos) = self.send_queue.iter().position(|&i| i == idx) {
                    self.send_queue.remove(pos);
                }
            } else if self.send_queue.len() > 1 {
                self.send_queue.rotate_left(1);
            }
        }

        if writer.data_len() == 0 {
            return Ok(None);
        }

        let controller = Arc::clone(&self.shared.controller);
        writer.try_compress(|data, out| controller.compress(data, out));
        let pkt = writer.finish();
        let slot_idx = self
            .slot_free
            .pop()
            .expect("caller checked a free slot exists");
        let slot = &mut self.send_slots[slot_idx as usize];
        debug_assert!(slot.packet.is_none());
        slot.packet = Some(pkt);
        slot.msg_indices = completed;
        slot.resend_count = 0;
        self.send_id = id_next(self.send_id);
        Ok(Some(slot_idx))
    }

    fn relay_info(&self) -> Option<RelayInfo> {
        match &self.kind {
            Kind::Direct => None,
            Kind::Relayed {
                token, network_id, ..
            } => Some(RelayInfo {
                relay_id: *token,
                network_id: *network_id,
            }),
        }
    }

    fn slot_of_packet(&self, id: u32) -> Option<u8> {
        self.send_slots
            .iter()
            .position(|s| s.packet.as_ref().is_some_and(|p| p.id() == id))
            .map(|i| i as u8)
    }

    fn handshake_slot(&self, ptype: PacketType) -> Option<u8> {
        self.send_slots
            .iter()
            .position(|s| s.packet.as_ref().is_some_and(|p| p.packet_type() == ptype))
            .map(|i| i as u8)
    }

    /// Emit one stored packet and arm its retransmit timer.
    fn transmit_slot(&mut self, stub: &mut TalkerStub<'_>, slot_idx: u8) {
        let (id, resend_count, unique, bytes) = {
            let slot = &self.send_slots[slot_idx as usize];
            let Some(pkt) = &slot.packet else {
                return;
            };
            (pkt.id(), slot.resend_count, slot.unique, pkt.bytes().clone())
        };
        let timeout = self.compute_retransmit_timeout(resend_count as u32, id);
        stub.push_send(self.pair_addr, bytes);
        stub.push_timer(stub.now + timeout, slot_idx, unique);
    }

    fn compute_retransmit_timeout(&mut self, retransmit: u32, packet_id: u32) -> Duration {
        if packet_id & REFRESH_INDEX_MASK == 0 {
            self.retransmit_time_pos = 0;
        }
        if retransmit > self.retransmit_time_pos {
            self.retransmit_time_pos = retransmit;
        }
        retransmit_timeout(self.retransmit_time_pos + retransmit)
    }

    /// Drive the session forward: handshakes, data packets, update-only
    /// packets and keep-alive arming.
    pub fn execute(&mut self, stub: &mut TalkerStub<'_>) -> ExecuteOutcome {
        if self.dead {
            return ExecuteOutcome::Destroy;
        }
        match self.state {
            State::Connecting | State::RelayConnecting => {
                self.send_connect(stub);
                ExecuteOutcome::Idle
            }
            State::Accepting | State::RelayAccepting => {
                self.send_accept(stub);
                ExecuteOutcome::Idle
            }
            State::WaitAccept => ExecuteOutcome::Idle,
            State::Connected | State::Authenticating | State::WaitDisconnecting => {
                self.pump_send(stub);
                if self.dead {
                    return ExecuteOutcome::Destroy;
                }
                if self.state == State::WaitDisconnecting
                    && self.pending.is_empty()
                    && self.send_queue.is_empty()
                    && self.all_slots_free()
                {
                    self.state = State::Disconnecting;
                }
                if self.state == State::Disconnecting {
                    self.teardown(CompletionStatus::NotSent);
                    return ExecuteOutcome::Destroy;
                }
                ExecuteOutcome::Idle
            }
            State::Disconnecting | State::Reconnecting | State::Disconnected => {
                self.teardown(CompletionStatus::NotSent);
                ExecuteOutcome::Destroy
            }
        }
    }

    fn send_connect(&mut self, stub: &mut TalkerStub<'_>) {
        if self.handshake_slot(PacketType::Connect).is_some() {
            self.state = State::WaitAccept;
            return;
        }
        let connect = match &self.kind {
            Kind::Direct => ConnectData::basic(stub.base_port(), self.shared.timestamp),
            Kind::Relayed {
                peer_address,
                network_id,
                token,
                ..
            } => ConnectData::relayed(
                stub.base_port(),
                self.shared.timestamp,
                *token,
                RelayData {
                    receiver_network_id: *network_id,
                    receiver_address: *peer_address,
                    sender_network_id: self.shared.config.local_network_id,
                    sender_address: self.shared.config.base_address,
                },
            ),
        };
        self.send_handshake(stub, PacketType::Connect, &connect.store());
        debug!(peer = %self.pair_addr, relayed = self.is_relayed(), "connect sent");
        self.state = State::WaitAccept;
    }

    fn send_accept(&mut self, stub: &mut TalkerStub<'_>) {
        if self.handshake_slot(PacketType::Accept).is_some() {
            return;
        }
        let accept = AcceptData {
            flags: 0,
            base_port: stub.base_port(),
            timestamp: self.peer_timestamp.unwrap_or_default(),
            relay_id: self.peer_relay_id,
        };
        self.send_handshake(stub, PacketType::Accept, &accept.store());
        debug!(peer = %self.pair_addr, "accept sent");
        self.state = if self.shared.controller.authentication_required() {
            State::Authenticating
        } else {
            State::Connected
        };
        self.drain_out_of_order(stub);
    }

    /// Handshake packets are sequenced like data so acknowledgement and
    /// retransmission share one mechanism; both sides spend id 1 on them,
    /// which is why a fresh session expects id 2 first.
    fn send_handshake(&mut self, stub: &mut TalkerStub<'_>, ptype: PacketType, payload: &[u8]) {
        let relay = self.relay_info();
        let pkt =
            PacketWriter::sequenced_control(ptype, self.send_id, relay, &mut self.rcvd_ids, payload);
        self.send_id = id_next(self.send_id);
        let Some(slot_idx) = self.slot_free.pop() else {
            warn!("no free slot for handshake packet");
            return;
        };
        let slot = &mut self.send_slots[slot_idx as usize];
        slot.packet = Some(pkt);
        slot.msg_indices.clear();
        slot.resend_count = 0;
        self.transmit_slot(stub, slot_idx);
    }

    /// The data-phase pump: refill the send queue, emit as many packets as
    /// slots and data allow, then fall back to an update-only packet or a
    /// keep-alive timer.
    fn pump_send(&mut self, stub: &mut TalkerStub<'_>) {
        self.move_pending_to_send_queue();
        let mut sent_data = false;
        loop {
            if self.slot_free.is_empty() {
                break;
            }
            if self.send_queue.is_empty() && self.cancel_queue.is_empty() {
                break;
            }
            match self.fill_data_packet() {
                Ok(Some(slot_idx)) => {
                    self.transmit_slot(stub, slot_idx);
                    sent_data = true;
                    self.move_pending_to_send_queue();
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "serialization failed, tearing session down");
                    self.teardown(CompletionStatus::NotSent);
                    return;
                }
            }
        }
        if !sent_data && self.must_send_updates() {
            self.send_update_packet(stub);
        }
        self.schedule_keepalive(stub);
    }

    fn must_send_updates(&self) -> bool {
        !self.rcvd_ids.is_empty()
            && (!self.expecting_immediate_data()
                || self.rcvd_ids.len() >= self.shared.config.session.max_recv_no_update_count)
    }

    /// True while an inbound message is partially reassembled, meaning
    /// more data from the peer is imminent and acks can ride on it.
    fn expecting_immediate_data(&self) -> bool {
        self.recv_slots.iter().any(|s| s.is_some())
    }

    /// An update-only packet: unsequenced, unacknowledged, pure ack
    /// carrier.
    fn send_update_packet(&mut self, stub: &mut TalkerStub<'_>) {
        let relay = self.relay_info();
        let writer = PacketWriter::sequenced(
            PacketType::Data,
            UPDATE_PACKET_ID,
            relay,
            &mut self.rcvd_ids,
        );
        let pkt = writer.finish();
        stub.push_send(self.pair_addr, pkt.bytes().clone());
        trace!("update-only packet sent");
    }

    /// The keep-alive period currently in force, or `None` while the
    /// session has live traffic that replaces it.
    fn current_keepalive(&self) -> Option<Duration> {
        let session = &self.shared.config.session;
        let (keepalive, response_keepalive) = if self.is_relayed() {
            (session.relay_keepalive, session.relay_response_keepalive)
        } else {
            (session.keepalive, session.response_keepalive)
        };
        let mut period = if self.sent_wait_response > 0 && !response_keepalive.is_zero() {
            response_keepalive
        } else {
            keepalive
        };
        match self.state {
            State::WaitDisconnecting => period = Duration::ZERO,
            State::Authenticating => period = Duration::from_secs(1),
            _ => {}
        }
        if period.is_zero() {
            return None;
        }
        let idle = !self.expecting_immediate_data()
            && self.pending.is_empty()
            && self.send_queue.is_empty()
            && self.all_slots_free();
        idle.then_some(period)
    }

    fn schedule_keepalive(&mut self, stub: &mut TalkerStub<'_>) {
        if self.keepalive_armed || self.send_slots[0].packet.is_some() {
            return;
        }
        let Some(period) = self.current_keepalive() else {
            return;
        };
        self.keepalive_armed = true;
        let unique = self.send_slots[0].unique;
        stub.push_timer(self.last_recv_time + period, 0, unique);
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Feed one datagram addressed to this session.
    pub fn process_packet(&mut self, stub: &mut TalkerStub<'_>, datagram: &[u8]) {
        let inbound = match InboundPacket::parse(datagram) {
            Ok(p) => p,
            Err(e) => {
                trace!(error = %e, "dropping corrupt datagram");
                return;
            }
        };
        self.last_recv_time = stub.now;
        for &id in &inbound.updates {
            self.free_sent_packet(id);
        }
        match inbound.ptype {
            PacketType::Connect => self.on_connect_packet(stub, &inbound),
            PacketType::Accept => self.on_accept_packet(stub, &inbound),
            PacketType::Error => {
                let code = ErrorData::load(inbound.data()).map(|e| e.code).unwrap_or(0);
                debug!(code, "error packet from peer");
                let status = if code == ErrorData::AUTH_REFUSED {
                    CompletionStatus::AuthenticationFailure
                } else {
                    CompletionStatus::NotSent
                };
                self.teardown(status);
            }
            PacketType::Data | PacketType::KeepAlive => self.on_sequenced_packet(stub, inbound),
        }
    }

    fn on_connect_packet(&mut self, stub: &mut TalkerStub<'_>, inbound: &InboundPacket) {
        let connect = match ConnectData::load(inbound.data()) {
            Ok(c) => c,
            Err(e) => {
                trace!(error = %e, "bad connect payload");
                return;
            }
        };
        if !connect.version_supported() {
            let err = ErrorData {
                code: ErrorData::BAD_VERSION,
            };
            let pkt = PacketWriter::control(PacketType::Error, &err.store());
            stub.push_send(self.pair_addr, pkt.bytes().clone());
            self.teardown(CompletionStatus::NotSent);
            return;
        }
        match self.peer_timestamp {
            Some(ts) if ts == connect.timestamp => {
                // retransmitted connect; our accept was lost. Ack again and
                // resend the accept if it is still stored.
                self.rcvd_ids.push_back(inbound.id);
                if let Some(slot_idx) = self.handshake_slot(PacketType::Accept) {
                    self.send_slots[slot_idx as usize].resend_count = 0;
                    self.transmit_slot(stub, slot_idx);
                }
            }
            Some(_) => {
                // the peer restarted; this incarnation of the session is
                // stale. Die so a fresh accept can form.
                debug!(peer = %self.pair_addr, "peer restarted");
                self.state = State::Reconnecting;
                self.teardown(CompletionStatus::NotSent);
            }
            None => {
                // connect raced our own connect (simultaneous open): adopt
                // the accepting role metadata and answer.
                self.peer_timestamp = Some(connect.timestamp);
                self.peer_base_port = connect.base_port;
                self.peer_relay_id = connect.relay_id;
                self.rcvd_ids.push_back(inbound.id);
                self.send_accept(stub);
            }
        }
    }

    fn on_accept_packet(&mut self, stub: &mut TalkerStub<'_>, inbound: &InboundPacket) {
        if self.state != State::WaitAccept {
            // duplicate accept; ack it again
            self.rcvd_ids.push_back(inbound.id);
            return;
        }
        let accept = match AcceptData::load(inbound.data()) {
            Ok(a) => a,
            Err(e) => {
                trace!(error = %e, "bad accept payload");
                return;
            }
        };
        if accept.timestamp != self.shared.timestamp {
            // the peer saw a previous incarnation of this process
            debug!(peer = %self.pair_addr, "stale timestamp in accept");
            self.state = State::Reconnecting;
            self.teardown_with_error(Error::TryReconnect);
            return;
        }
        self.peer_base_port = accept.base_port;
        if self.is_relayed() {
            // the gateway rewrites tags per direction; we keep stamping our
            // own token and only record what came back
            self.peer_relay_id = accept.relay_id;
        }
        // the accept acknowledges our connect implicitly
        if let Some(slot_idx) = self.handshake_slot(PacketType::Connect) {
            self.clear_sent_packet(slot_idx);
        }
        self.rcvd_ids.push_back(inbound.id);
        self.state = if self.shared.controller.authentication_required() {
            State::Authenticating
        } else {
            State::Connected
        };
        debug!(peer = %self.pair_addr, "session connected");
        self.drain_out_of_order(stub);
    }

    fn on_sequenced_packet(&mut self, stub: &mut TalkerStub<'_>, inbound: InboundPacket) {
        if inbound.id == UPDATE_PACKET_ID {
            return;
        }
        if !self.state.is_active() && self.state != State::WaitDisconnecting {
            // mid-handshake: hold the packet, deliver after the accept
            if self.out_of_order.len() < MAX_OUT_OF_ORDER
                && !self.out_of_order.iter().any(|p| p.id == inbound.id)
            {
                self.out_of_order.push(inbound);
            }
            return;
        }
        // receipt of any sequenced packet proves our accept arrived
        if let Some(slot_idx) = self.handshake_slot(PacketType::Accept) {
            self.clear_sent_packet(slot_idx);
        }

        if inbound.id == self.rcv_expected_id {
            self.rcvd_ids.push_back(inbound.id);
            self.rcv_expected_id = id_next(self.rcv_expected_id);
            self.consume_data(stub, &inbound);
            self.drain_out_of_order(stub);
        } else if id_less(inbound.id, self.rcv_expected_id) {
            // duplicate: the ack we sent earlier was lost. Ack again, drop
            // the payload.
            trace!(
                id = inbound.id,
                expected = self.rcv_expected_id,
                "duplicate packet"
            );
            self.rcvd_ids.push_back(inbound.id);
        } else {
            let ahead = id_distance(self.rcv_expected_id, inbound.id) as usize;
            if ahead <= MAX_OUT_OF_ORDER
                && self.out_of_order.len() < MAX_OUT_OF_ORDER
                && !self.out_of_order.iter().any(|p| p.id == inbound.id)
            {
                self.out_of_order.push(inbound);
            } else {
                trace!(id = inbound.id, "out-of-order buffer full, dropping");
            }
        }
    }

    /// Deliver buffered packets that became in-order.
    fn drain_out_of_order(&mut self, stub: &mut TalkerStub<'_>) {
        if !self.state.is_active() && self.state != State::WaitDisconnecting {
            return;
        }
        while let Some(pos) = self
            .out_of_order
            .iter()
            .position(|p| p.id == self.rcv_expected_id)
        {
            let pkt = self.out_of_order.swap_remove(pos);
            self.rcvd_ids.push_back(pkt.id);
            self.rcv_expected_id = id_next(self.rcv_expected_id);
            self.consume_data(stub, &pkt);
            if self.dead {
                return;
            }
        }
    }

    /// Walk the fragment records of an in-order data packet, feeding
    /// deserializers and delivering completed messages.
    fn consume_data(&mut self, stub: &mut TalkerStub<'_>, inbound: &InboundPacket) {
        if inbound.ptype != PacketType::Data {
            return;
        }
        let decompressed;
        let data: &[u8] = if inbound.is_compressed() {
            let mut buf = Vec::new();
            match self.shared.controller.decompress(inbound.data(), &mut buf) {
                Ok(_) => {
                    decompressed = buf;
                    &decompressed
                }
                Err(e) => {
                    warn!(error = %e, "decompression failed");
                    self.teardown(CompletionStatus::NotSent);
                    return;
                }
            }
        } else {
            inbound.data()
        };

        let max_multiplex = self.shared.config.session.max_send_message_queue_size as usize;
        for fragment in FragmentIter::new(data) {
            let fragment = match fragment {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "malformed data area");
                    self.teardown(CompletionStatus::NotSent);
                    return;
                }
            };
            let slot = fragment.msg_idx as usize;
            if slot >= max_multiplex {
                warn!(slot, "peer exceeded the multiplex bound");
                self.teardown(CompletionStatus::NotSent);
                return;
            }
            if self.recv_slots.len() <= slot {
                self.recv_slots.resize_with(slot + 1, || None);
            }
            if fragment.is_cancel {
                self.recv_slots[slot] = None;
                continue;
            }
            if fragment.is_start {
                let head = fragment.head.expect("start fragment carries a head");
                let deserializer = match self.shared.protocol.deserializer(head.type_id) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(error = %e, type_id = head.type_id, "unknown inbound type");
                        self.teardown(CompletionStatus::NotSent);
                        return;
                    }
                };
                self.recv_slots[slot] = Some(RecvSlot { deserializer, head });
            }
            {
                let Some(recv) = self.recv_slots[slot].as_mut() else {
                    trace!(slot, "fragment for an inactive slot");
                    continue;
                };
                if let Err(e) = recv.deserializer.consume(fragment.payload) {
                    warn!(error = %e, "deserializer rejected fragment");
                    self.recv_slots[slot] = None;
                    continue;
                }
            }
            if fragment.is_end {
                let mut recv = self.recv_slots[slot].take().expect("slot just used");
                match recv.deserializer.finish() {
                    Ok(msg) => {
                        self.deliver_message(stub, recv.head, msg);
                        if self.dead {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "message deserialization failed");
                        self.teardown(CompletionStatus::NotSent);
                        return;
                    }
                }
            }
        }
    }

    fn deliver_message(
        &mut self,
        stub: &mut TalkerStub<'_>,
        head: MessageHead,
        msg: Arc<dyn Message>,
    ) {
        if head.flags & flags::RESPONSE != 0 {
            let uid = MessageUid::new(head.request_index, head.request_unique);
            let matching = self.send_messages.get(uid.index as usize).is_some_and(|r| {
                r.unique == uid.unique && !r.is_free() && r.flags & flags::WAIT_RESPONSE != 0
            });
            if !matching {
                trace!(request = %uid, "stale response dropped");
                return;
            }
            self.sent_wait_response = self.sent_wait_response.saturating_sub(1);
            self.complete_message(uid.index, Some(msg), CompletionStatus::Success);
            return;
        }

        let mut ctx = self.ctx();
        if head.flags & flags::WAIT_RESPONSE != 0 {
            ctx.request_uid = MessageUid::new(head.request_index, head.request_unique);
        }

        if self.state == State::Authenticating {
            let controller = Arc::clone(&self.shared.controller);
            match controller.authenticate(&ctx, msg) {
                AuthResult::Accept(reply) => {
                    if let Some((reply, type_id)) = reply {
                        let _ = self.push_message(
                            reply,
                            type_id,
                            flags::AUTHENTICATION,
                            MessageUid::INVALID,
                        );
                    }
                    self.state = State::Connected;
                    debug!(peer = %self.pair_addr, "authentication accepted");
                }
                AuthResult::Continue(reply, type_id) => {
                    let _ = self.push_message(
                        reply,
                        type_id,
                        flags::AUTHENTICATION,
                        MessageUid::INVALID,
                    );
                }
                AuthResult::Reject => {
                    debug!(peer = %self.pair_addr, "authentication rejected");
                    let err = ErrorData {
                        code: ErrorData::AUTH_REFUSED,
                    };
                    let pkt = PacketWriter::control(PacketType::Error, &err.store());
                    stub.push_send(self.pair_addr, pkt.bytes().clone());
                    self.teardown(CompletionStatus::AuthenticationFailure);
                }
            }
            return;
        }

        self.shared.controller.on_receive(&ctx, msg);
    }

    /// Acknowledge one of our packets: free the slot and run completions
    /// for the messages whose serialization ended in it.
    fn free_sent_packet(&mut self, id: u32) {
        if self.send_slots[0]
            .packet
            .as_ref()
            .is_some_and(|p| p.id() == id)
        {
            // keep-alive acknowledged
            let slot = &mut self.send_slots[0];
            slot.packet = None;
            slot.resend_count = 0;
            slot.unique = slot.unique.wrapping_add(1);
            return;
        }
        if let Some(slot_idx) = self.slot_of_packet(id)
            && slot_idx != 0
        {
            self.clear_sent_packet(slot_idx);
        }
    }

    fn clear_sent_packet(&mut self, slot_idx: u8) {
        let slot = &mut self.send_slots[slot_idx as usize];
        slot.packet = None;
        slot.resend_count = 0;
        slot.unique = slot.unique.wrapping_add(1);
        let indices = std::mem::take(&mut slot.msg_indices);
        self.slot_free.push(slot_idx);
        for idx in indices {
            self.on_message_acknowledged(idx);
        }
    }

    fn on_message_acknowledged(&mut self, idx: u32) {
        let stub = &mut self.send_messages[idx as usize];
        if stub.is_free() {
            return;
        }
        if stub.flags & flags::DISCONNECT_AFTER_SEND != 0 {
            self.state = State::Disconnecting;
        }
        let stub = &mut self.send_messages[idx as usize];
        if stub.flags & flags::WAIT_RESPONSE != 0 {
            // keep the stub; the correlated response completes it
            stub.flags |= flags::SENT;
            return;
        }
        self.complete_message(idx, None, CompletionStatus::Success);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Handle an expired timer for `(slot, slot_unique)`.
    pub fn on_timer(&mut self, stub: &mut TalkerStub<'_>, slot_idx: u8, slot_unique: u16) {
        if self.dead {
            return;
        }
        {
            let Some(slot) = self.send_slots.get(slot_idx as usize) else {
                return;
            };
            if slot.unique != slot_unique {
                return;
            }
            if slot.packet.is_none() {
                if slot_idx == 0 {
                    self.fire_keepalive(stub);
                }
                return;
            }
        }
        // retransmission
        let (is_handshake, resend_count) = {
            let slot = &mut self.send_slots[slot_idx as usize];
            let is_handshake = matches!(
                slot.packet.as_ref().expect("checked above").packet_type(),
                PacketType::Connect | PacketType::Accept
            );
            slot.resend_count += 1;
            (is_handshake, slot.resend_count)
        };
        let budget = if is_handshake {
            self.shared.config.session.connect_retransmit_count
        } else {
            self.shared.config.session.data_retransmit_count
        };
        if resend_count > budget {
            if self.try_gateway_failover() {
                self.send_slots[slot_idx as usize].resend_count = 0;
                self.transmit_slot(stub, slot_idx);
                return;
            }
            debug!(peer = %self.pair_addr, "retransmit budget exhausted");
            self.teardown(CompletionStatus::NotSent);
            return;
        }
        trace!(slot = slot_idx, count = resend_count, "retransmit");
        self.transmit_slot(stub, slot_idx);
    }

    /// On a relayed session the retransmit budget may be reset once by
    /// rotating to the next configured gateway.
    fn try_gateway_failover(&mut self) -> bool {
        let gateways = &self.shared.config.gateway_addresses;
        let Kind::Relayed {
            crt_gw_idx,
            failover_used,
            ..
        } = &mut self.kind
        else {
            return false;
        };
        if *failover_used || gateways.len() < 2 {
            return false;
        }
        *failover_used = true;
        *crt_gw_idx = (*crt_gw_idx + 1) % gateways.len();
        self.pair_addr = gateways[*crt_gw_idx];
        debug!(gateway = %self.pair_addr, "rotating to the next gateway");
        true
    }

    fn fire_keepalive(&mut self, stub: &mut TalkerStub<'_>) {
        self.keepalive_armed = false;
        let Some(period) = self.current_keepalive() else {
            return;
        };
        if stub.now < self.last_recv_time + period {
            // traffic arrived since the timer was armed; push it out
            self.keepalive_armed = true;
            let unique = self.send_slots[0].unique;
            stub.push_timer(self.last_recv_time + period, 0, unique);
            return;
        }
        let relay = self.relay_info();
        let writer = PacketWriter::sequenced(
            PacketType::KeepAlive,
            self.send_id,
            relay,
            &mut self.rcvd_ids,
        );
        self.send_id = id_next(self.send_id);
        let pkt = writer.finish();
        let slot = &mut self.send_slots[0];
        slot.unique = slot.unique.wrapping_add(1);
        slot.packet = Some(pkt);
        slot.resend_count = 0;
        trace!(peer = %self.pair_addr, "keep-alive sent");
        self.transmit_slot(stub, 0);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn teardown_with_error(&mut self, error: Error) {
        debug!(peer = %self.pair_addr, error = %error, "session torn down");
        self.teardown(CompletionStatus::NotSent);
    }

    /// Tear the session down, completing every live message exactly once:
    /// sent-awaiting-response stubs with `SentNoResponse`, everything else
    /// with `unsent_status`.
    pub fn teardown(&mut self, unsent_status: CompletionStatus) {
        if self.dead {
            return;
        }
        self.dead = true;
        self.state = State::Disconnected;
        self.pending.clear();
        self.send_queue.clear();
        self.current_send_sync = None;
        self.cancel_queue.clear();
        for slot in &mut self.send_slots {
            slot.packet = None;
            slot.msg_indices.clear();
            slot.unique = slot.unique.wrapping_add(1);
        }
        let slot_count = self.send_slots.len() as u8;
        self.slot_free = (1..slot_count).rev().collect();
        for idx in 0..self.send_messages.len() as u32 {
            let stub = &self.send_messages[idx as usize];
            if stub.is_free() {
                continue;
            }
            let status = if stub.flags & (flags::WAIT_RESPONSE | flags::SENT)
                == (flags::WAIT_RESPONSE | flags::SENT)
            {
                CompletionStatus::SentNoResponse
            } else {
                unsent_status
            };
            self.complete_message(idx, None, status);
        }
        self.sent_wait_response = 0;
        self.recv_slots.clear();
        self.out_of_order.clear();
        self.rcvd_ids.clear();
    }

    /// Number of live send-message stubs; zero after teardown.
    pub fn live_message_count(&self) -> usize {
        self.send_messages.iter().filter(|s| !s.is_free()).count()
    }

    /// Number of occupied send-packet slots; zero after teardown.
    pub fn occupied_slot_count(&self) -> usize {
        self.send_slots.iter().filter(|s| s.packet.is_some()).count()
    }

    /// Requests sent and still awaiting their response.
    pub fn wait_response_count(&self) -> u32 {
        self.sent_wait_response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_table_clamps_at_the_tail() {
        assert_eq!(retransmit_timeout(0), Duration::from_millis(100));
        assert_eq!(retransmit_timeout(3), Duration::from_millis(800));
        assert_eq!(
            retransmit_timeout(1000),
            Duration::from_millis(*RETRANSMIT_TIMEOUTS_MS.last().unwrap())
        );
    }

    #[test]
    fn active_states() {
        assert!(State::Connected.is_active());
        assert!(State::Authenticating.is_active());
        assert!(!State::WaitAccept.is_active());
        assert!(!State::Disconnected.is_active());
    }
}
