//! The talker: one UDP socket multiplexing many sessions.
//!
//! Each talker is a tokio task plus a core of session state behind a
//! mutex. The lock is held for short synchronous bursts only, never
//! across an await: the task drains datagrams, fires timers and executes
//! sessions under the lock, then sends the produced datagrams with the
//! lock released. The service pushes work in through the same lock, which
//! is the talker-mutex arrangement of the original design.
//!
//! Lock order is registry before core; the death path collects removals
//! under the core lock and applies them to the registry afterwards.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::error::{CompletionStatus, Error, Result};
use super::handshake::{AcceptData, ConnectData, ErrorData};
use super::node::Node;
use super::packet::{self, InboundPacket, PacketType, PacketWriter};
use super::protocol::{Message, MessageTypeId, MessageUid};
use super::service::{ConnectionUid, Registry};
use super::session::{
    ExecuteOutcome, Session, SessionShared, TalkerStub, TimerRequest, Transmit,
};
use crate::util::addr::{BaseAddress, RelayAddress};

/// Datagrams drained per wakeup before yielding back to the runtime.
const RECV_BATCH: usize = 16;

struct SessionEntry {
    session: Session,
    unique: u32,
    scheduled: bool,
}

/// A session removal to apply to the service registry.
pub(crate) struct Removal {
    pub base: BaseAddress,
    pub relay: Option<RelayAddress>,
    pub uid: ConnectionUid,
}

/// A freshly accepted session to record in the service registry.
pub(crate) struct Admission {
    pub base: BaseAddress,
    pub relay: Option<RelayAddress>,
    pub uid: ConnectionUid,
}

#[derive(PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    session_index: u16,
    slot: u8,
    slot_unique: u16,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert for earliest-first
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.session_index.cmp(&self.session_index))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct TalkerCore {
    talker_index: u16,
    base_port: u16,
    shared: SessionShared,
    sessions: Vec<Option<SessionEntry>>,
    /// Per-slot reuse counters backing the `unique` of ConnectionUid.
    uniques: Vec<u32>,
    free: Vec<u16>,
    /// Datagram source address -> session.
    by_addr: HashMap<SocketAddr, u16>,
    /// Relay tag -> session, for relayed packets arriving from a gateway.
    by_relay_token: HashMap<u32, u16>,
    exec_queue: VecDeque<u16>,
    timers: BinaryHeap<TimerEntry>,
    pending_timers: Vec<TimerRequest>,
    out: VecDeque<Transmit>,
    /// Present on gateway processes.
    node: Option<Node>,
    next_relay_token: u32,
    admissions: Vec<Admission>,
}

impl TalkerCore {
    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|t| t.deadline)
    }

    /// A talker-unique nonzero relay token for a new relayed session.
    pub fn take_relay_token(&mut self) -> u32 {
        self.next_relay_token = self.next_relay_token.wrapping_add(1).max(1);
        self.next_relay_token
    }

    /// Insert a session, wiring its connection uid and demux keys.
    pub fn insert_session(&mut self, mut session: Session) -> ConnectionUid {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.sessions.push(None);
                self.uniques.push(0);
                (self.sessions.len() - 1) as u16
            }
        };
        let unique = self.uniques[idx as usize];
        let uid = ConnectionUid {
            talker_index: self.talker_index,
            session_index: idx,
            unique,
        };
        session.set_connection_uid(uid);
        self.by_addr.insert(session.pair_address(), idx);
        if let Some(token) = session.relay_token() {
            self.by_relay_token.insert(token, idx);
        }
        self.sessions[idx as usize] = Some(SessionEntry {
            session,
            unique,
            scheduled: false,
        });
        self.schedule(idx);
        uid
    }

    fn schedule(&mut self, idx: u16) {
        if let Some(entry) = self.sessions[idx as usize].as_mut()
            && !entry.scheduled
        {
            entry.scheduled = true;
            self.exec_queue.push_back(idx);
        }
    }

    fn entry_for_uid(&mut self, uid: ConnectionUid) -> Option<&mut SessionEntry> {
        let entry = self.sessions.get_mut(uid.session_index as usize)?.as_mut()?;
        (entry.unique == uid.unique).then_some(entry)
    }

    /// Push a message onto a session by connection handle.
    pub fn push_message(
        &mut self,
        uid: ConnectionUid,
        msg: Arc<dyn Message>,
        type_id: MessageTypeId,
        flags: u32,
        request_uid: MessageUid,
    ) -> Result<MessageUid> {
        let entry = self.entry_for_uid(uid).ok_or(Error::NoConnection)?;
        let msg_uid = entry.session.push_message(msg, type_id, flags, request_uid)?;
        self.schedule(uid.session_index);
        Ok(msg_uid)
    }

    /// Cancel a message on a session by connection handle.
    pub fn cancel_message(&mut self, uid: ConnectionUid, msg_uid: MessageUid) -> Result<()> {
        let entry = self.entry_for_uid(uid).ok_or(Error::NoConnection)?;
        entry.session.cancel_message(msg_uid);
        self.schedule(uid.session_index);
        Ok(())
    }

    /// Ask a session to close once drained.
    pub fn disconnect(&mut self, uid: ConnectionUid) -> Result<()> {
        let entry = self.entry_for_uid(uid).ok_or(Error::NoConnection)?;
        entry.session.disconnect();
        self.schedule(uid.session_index);
        Ok(())
    }

    /// Tear every session down (service stop).
    pub fn teardown_all(&mut self) -> Vec<Removal> {
        let mut removals = Vec::new();
        for idx in 0..self.sessions.len() as u16 {
            if self.sessions[idx as usize].is_some() {
                if let Some(removal) = self.remove_session(idx, CompletionStatus::NotSent) {
                    removals.push(removal);
                }
            }
        }
        removals
    }

    fn remove_session(&mut self, idx: u16, status: CompletionStatus) -> Option<Removal> {
        let mut entry = self.sessions[idx as usize].take()?;
        entry.session.teardown(status);
        let base = entry.session.peer_base_address();
        let relay = entry.session.relay_address();
        let uid = entry.session.connection_uid();
        self.by_addr.remove(&entry.session.pair_address());
        if let Some(token) = entry.session.relay_token() {
            self.by_relay_token.remove(&token);
        }
        self.uniques[idx as usize] = self.uniques[idx as usize].wrapping_add(1);
        self.free.push(idx);
        debug!(session = idx, peer = %base, "session removed");
        Some(Removal { base, relay, uid })
    }

    /// Route one datagram: gateway forwarding first, then local sessions,
    /// then admission of new accepting sessions.
    fn dispatch(&mut self, src: SocketAddr, datagram: &[u8], now: Instant) {
        let inbound = match InboundPacket::parse(datagram) {
            Ok(p) => p,
            Err(e) => {
                trace!(error = %e, from = %src, "undecodable datagram");
                return;
            }
        };

        // relayed packets demux by tag (many sessions share the gateway's
        // source address); everything else by source address
        let local = match inbound.relay {
            Some(r) => self.by_relay_token.get(&r.relay_id).copied(),
            None => self.by_addr.get(&src).copied(),
        };
        if let Some(idx) = local {
            self.feed_session(idx, datagram, now);
            return;
        }

        if self.node.is_some() && self.try_forward(src, &inbound, datagram, now) {
            return;
        }

        match inbound.ptype {
            PacketType::Connect => self.admit_session(src, &inbound, datagram, now),
            PacketType::Error => {}
            _ => {
                // no session and not a connect: tell the peer
                trace!(from = %src, "datagram for no session");
                let err = ErrorData {
                    code: ErrorData::NO_SESSION,
                };
                let pkt = PacketWriter::control(PacketType::Error, &err.store());
                self.out.push_back(Transmit {
                    to: src,
                    bytes: pkt.bytes().clone(),
                });
            }
        }
    }

    /// Gateway forwarding. Returns true when the datagram was consumed.
    fn try_forward(
        &mut self,
        src: SocketAddr,
        inbound: &InboundPacket,
        datagram: &[u8],
        now: Instant,
    ) -> bool {
        let local_network = self.shared.config.local_network_id;
        let node = self.node.as_mut().expect("caller checked");
        match inbound.ptype {
            PacketType::Connect => {
                let Ok(connect) = ConnectData::load(inbound.data()) else {
                    return false;
                };
                let Some(relay) = connect.relay else {
                    return false;
                };
                if relay.receiver_network_id == local_network {
                    return false;
                }
                let Some((to, forwarded)) = node.handle_connect(src, &connect, now) else {
                    return true;
                };
                // rewrite the header tag too, so the receiver demuxes
                // retransmitted connects by the tag it will adopt
                let relay_info = inbound.relay.map(|r| packet::RelayInfo {
                    relay_id: forwarded.relay_id,
                    network_id: r.network_id,
                });
                let pkt = PacketWriter::sequenced_control(
                    PacketType::Connect,
                    inbound.id,
                    relay_info,
                    &mut VecDeque::new(),
                    &forwarded.store(),
                );
                trace!(from = %src, to = %to, "connect forwarded");
                self.out.push_back(Transmit {
                    to,
                    bytes: pkt.bytes().clone(),
                });
                true
            }
            PacketType::Accept => {
                let Ok(accept) = AcceptData::load(inbound.data()) else {
                    return false;
                };
                let Some((to, forwarded)) = node.handle_accept(src, &accept, now) else {
                    return false;
                };
                let relay_info = inbound.relay.map(|r| packet::RelayInfo {
                    relay_id: forwarded.relay_id,
                    network_id: r.network_id,
                });
                let pkt = PacketWriter::sequenced_control(
                    PacketType::Accept,
                    inbound.id,
                    relay_info,
                    &mut VecDeque::new(),
                    &forwarded.store(),
                );
                trace!(from = %src, to = %to, "accept forwarded");
                self.out.push_back(Transmit {
                    to,
                    bytes: pkt.bytes().clone(),
                });
                true
            }
            PacketType::Data | PacketType::KeepAlive => {
                let Some(relay) = inbound.relay else {
                    return false;
                };
                let Some(forward) = node.route(src, relay.relay_id, now) else {
                    return false;
                };
                let mut bytes = datagram.to_vec();
                if packet::rewrite_relay_id(&mut bytes, forward.relay_id).is_err() {
                    return false;
                }
                self.out.push_back(Transmit {
                    to: forward.to,
                    bytes: bytes.into(),
                });
                true
            }
            PacketType::Error => false,
        }
    }

    /// Create an accepting session for an inbound Connect.
    fn admit_session(
        &mut self,
        src: SocketAddr,
        inbound: &InboundPacket,
        datagram: &[u8],
        now: Instant,
    ) {
        let connect = match ConnectData::load(inbound.data()) {
            Ok(c) => c,
            Err(e) => {
                trace!(error = %e, from = %src, "undecodable connect");
                return;
            }
        };
        let session = if connect.relay.is_some() {
            match Session::relay_accepting(src, &connect, self.shared.clone(), now) {
                Ok(s) => s,
                Err(e) => {
                    trace!(error = %e, "relay connect rejected");
                    return;
                }
            }
        } else {
            Session::accepting(src, &connect, self.shared.clone(), now)
        };
        let base = session.peer_base_address();
        let relay = session.relay_address();
        debug!(peer = %base, from = %src, "session accepted");
        let uid = self.insert_session(session);
        self.admissions.push(Admission { base, relay, uid });
        self.feed_session(uid.session_index, datagram, now);
    }

    fn feed_session(&mut self, idx: u16, datagram: &[u8], now: Instant) {
        let Some(entry) = self.sessions[idx as usize].as_mut() else {
            return;
        };
        let mut stub = TalkerStub::new(now, self.base_port, idx, &mut self.out, &mut self.pending_timers);
        entry.session.process_packet(&mut stub, datagram);
        self.flush_pending_timers();
        self.schedule(idx);
    }

    fn flush_pending_timers(&mut self) {
        for req in self.pending_timers.drain(..) {
            self.timers.push(TimerEntry {
                deadline: req.deadline,
                session_index: req.session_index,
                slot: req.slot,
                slot_unique: req.slot_unique,
            });
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        while self.timers.peek().is_some_and(|t| t.deadline <= now) {
            let entry = self.timers.pop().expect("peeked");
            let idx = entry.session_index;
            let Some(se) = self.sessions.get_mut(idx as usize).and_then(|s| s.as_mut()) else {
                continue;
            };
            let mut stub = TalkerStub::new(
                now,
                self.base_port,
                idx,
                &mut self.out,
                &mut self.pending_timers,
            );
            se.session.on_timer(&mut stub, entry.slot, entry.slot_unique);
            self.flush_pending_timers();
            self.schedule(idx);
        }
    }

    /// Run every scheduled session once; collect the dead.
    fn drain_exec(&mut self, now: Instant, removals: &mut Vec<Removal>) {
        while let Some(idx) = self.exec_queue.pop_front() {
            let Some(entry) = self.sessions.get_mut(idx as usize).and_then(|s| s.as_mut()) else {
                continue;
            };
            entry.scheduled = false;
            let mut stub = TalkerStub::new(
                now,
                self.base_port,
                idx,
                &mut self.out,
                &mut self.pending_timers,
            );
            let outcome = entry.session.execute(&mut stub);
            self.flush_pending_timers();
            if outcome == ExecuteOutcome::Destroy
                && let Some(removal) = self.remove_session(idx, CompletionStatus::NotSent)
            {
                removals.push(removal);
            }
        }
    }

    fn take_transmits(&mut self) -> Vec<Transmit> {
        self.out.drain(..).collect()
    }

    fn take_admissions(&mut self) -> Vec<Admission> {
        std::mem::take(&mut self.admissions)
    }
}

/// Handle to one talker: the socket, the core and the task wakeup.
pub(crate) struct Talker {
    pub index: u16,
    pub base_port: u16,
    socket: Arc<UdpSocket>,
    core: Mutex<TalkerCore>,
    notify: Notify,
    stopping: AtomicBool,
}

impl Talker {
    /// Bind a talker and spawn its task.
    pub fn spawn(
        index: u16,
        socket: UdpSocket,
        shared: SessionShared,
        registry: Arc<Mutex<Registry>>,
        node: Option<Node>,
    ) -> std::io::Result<Arc<Self>> {
        let base_port = socket.local_addr()?.port();
        let talker = Arc::new(Self {
            index,
            base_port,
            socket: Arc::new(socket),
            core: Mutex::new(TalkerCore {
                talker_index: index,
                base_port,
                shared,
                sessions: Vec::new(),
                uniques: Vec::new(),
                free: Vec::new(),
                by_addr: HashMap::new(),
                by_relay_token: HashMap::new(),
                exec_queue: VecDeque::new(),
                timers: BinaryHeap::new(),
                pending_timers: Vec::new(),
                out: VecDeque::new(),
                node,
                next_relay_token: 0,
                admissions: Vec::new(),
            }),
            notify: Notify::new(),
            stopping: AtomicBool::new(false),
        });
        tokio::spawn(run(Arc::clone(&talker), registry));
        Ok(talker)
    }

    /// Run a closure against the core and wake the task afterwards.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut TalkerCore) -> R) -> R {
        let r = f(&mut self.core.lock().expect("talker core poisoned"));
        self.notify.notify_one();
        r
    }

    /// Ask the task to tear everything down and exit.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

async fn run(talker: Arc<Talker>, registry: Arc<Mutex<Registry>>) {
    let mut buf = vec![0u8; 65536];
    let mut datagrams: Vec<(SocketAddr, Vec<u8>)> = Vec::with_capacity(RECV_BATCH);
    loop {
        if talker.stopping.load(Ordering::SeqCst) {
            let removals = talker.with_core(|core| core.teardown_all());
            apply_registry(&registry, removals, Vec::new());
            debug!(talker = talker.index, "talker stopped");
            return;
        }

        let deadline = talker
            .core
            .lock()
            .expect("talker core poisoned")
            .next_deadline();

        datagrams.clear();
        tokio::select! {
            res = talker.socket.recv_from(&mut buf) => {
                match res {
                    Ok((n, src)) => {
                        datagrams.push((src, buf[..n].to_vec()));
                        while datagrams.len() < RECV_BATCH {
                            match talker.socket.try_recv_from(&mut buf) {
                                Ok((n, src)) => datagrams.push((src, buf[..n].to_vec())),
                                Err(_) => break,
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "socket receive failed");
                    }
                }
            }
            _ = talker.notify.notified() => {}
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d.into()).await,
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }

        let now = Instant::now();
        let mut removals = Vec::new();
        let (transmits, admissions) = {
            let mut core = talker.core.lock().expect("talker core poisoned");
            for (src, bytes) in datagrams.drain(..) {
                core.dispatch(src, &bytes, now);
            }
            core.fire_timers(now);
            core.drain_exec(now, &mut removals);
            if let Some(node) = core.node.as_mut() {
                node.expire(now);
            }
            (core.take_transmits(), core.take_admissions())
        };
        apply_registry(&registry, removals, admissions);
        for t in &transmits {
            if let Err(e) = talker.socket.send_to(&t.bytes, t.to).await {
                trace!(error = %e, to = %t.to, "send failed");
            }
        }
    }
}

fn apply_registry(
    registry: &Arc<Mutex<Registry>>,
    removals: Vec<Removal>,
    admissions: Vec<Admission>,
) {
    if removals.is_empty() && admissions.is_empty() {
        return;
    }
    let mut reg = registry.lock().expect("registry poisoned");
    for removal in removals {
        reg.remove_session(&removal);
    }
    for admission in admissions {
        reg.admit_session(&admission);
    }
}
