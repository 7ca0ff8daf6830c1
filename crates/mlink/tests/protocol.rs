//! Protocol scenario tests: two session state machines joined by an
//! in-memory pipe, with full control over time and packet loss.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use mlink::ipc::packet::InboundPacket;
use mlink::ipc::session::{Session, SessionShared, TalkerStub, TimerRequest, Transmit};
use mlink::ipc::{
    CompletionStatus, Configuration, ConnectionContext, Controller, JsonProtocol, Message,
    MessageUid, Timestamp, downcast, flags,
    handshake::ConnectData,
    packet::PacketType,
};

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
struct Blob {
    label: String,
    payload: String,
}

impl Message for Blob {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

const BLOB_TYPE: u32 = 1;

#[derive(Default)]
struct Recording {
    received: Mutex<Vec<(String, ConnectionContext)>>,
    completed: Mutex<Vec<(String, Option<String>, CompletionStatus)>>,
}

impl Recording {
    fn received_labels(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(l, _)| l.clone())
            .collect()
    }

    fn completions(&self) -> Vec<(String, Option<String>, CompletionStatus)> {
        self.completed.lock().unwrap().clone()
    }
}

impl Controller for Recording {
    fn on_receive(&self, ctx: &ConnectionContext, msg: Arc<dyn Message>) {
        let blob = downcast::<Blob>(&msg).expect("test traffic is blobs");
        self.received
            .lock()
            .unwrap()
            .push((blob.label.clone(), *ctx));
    }

    fn on_complete(
        &self,
        _ctx: &ConnectionContext,
        msg: Arc<dyn Message>,
        response: Option<Arc<dyn Message>>,
        status: CompletionStatus,
    ) {
        let blob = downcast::<Blob>(&msg).expect("test traffic is blobs");
        let response = response.map(|r| downcast::<Blob>(&r).unwrap().label.clone());
        self.completed
            .lock()
            .unwrap()
            .push((blob.label.clone(), response, status));
    }
}

struct Peer {
    session: Session,
    addr: SocketAddr,
    out: VecDeque<Transmit>,
    timers: Vec<TimerRequest>,
    controller: Arc<Recording>,
}

impl Peer {
    fn stub<'a>(
        now: Instant,
        addr: SocketAddr,
        out: &'a mut VecDeque<Transmit>,
        timers: &'a mut Vec<TimerRequest>,
    ) -> TalkerStub<'a> {
        TalkerStub::new(now, addr.port(), 0, out, timers)
    }

    fn execute(&mut self, now: Instant) {
        let mut stub = Self::stub(now, self.addr, &mut self.out, &mut self.timers);
        let _ = self.session.execute(&mut stub);
    }

    fn feed(&mut self, now: Instant, datagram: &[u8]) {
        let mut stub = Self::stub(now, self.addr, &mut self.out, &mut self.timers);
        self.session.process_packet(&mut stub, datagram);
    }

    fn fire_due_timers(&mut self, now: Instant) {
        let (due, rest): (Vec<TimerRequest>, Vec<TimerRequest>) =
            self.timers.drain(..).partition(|t| t.deadline <= now);
        self.timers = rest;
        for t in due {
            let mut stub = Self::stub(now, self.addr, &mut self.out, &mut self.timers);
            self.session.on_timer(&mut stub, t.slot, t.slot_unique);
        }
    }

    fn push(&mut self, label: &str, payload_len: usize, msg_flags: u32) -> MessageUid {
        let msg = Arc::new(Blob {
            label: label.to_string(),
            payload: "x".repeat(payload_len),
        });
        self.session
            .push_message(msg, BLOB_TYPE, msg_flags, MessageUid::INVALID)
            .expect("push accepted")
    }
}

fn shared(controller: &Arc<Recording>, timestamp: Timestamp) -> SessionShared {
    let mut protocol = JsonProtocol::new();
    protocol.register::<Blob>(BLOB_TYPE);
    SessionShared {
        config: Arc::new(Configuration::new("127.0.0.1:4500".parse().unwrap())),
        protocol: Arc::new(protocol),
        controller: Arc::clone(controller) as Arc<dyn Controller>,
        timestamp,
    }
}

/// Build a connected pair: A initiated, B accepted A's connect.
fn pair(now: Instant) -> (Peer, Peer) {
    let a_addr: SocketAddr = "127.0.0.1:4500".parse().unwrap();
    let b_addr: SocketAddr = "127.0.0.1:4600".parse().unwrap();
    let a_controller = Arc::new(Recording::default());
    let b_controller = Arc::new(Recording::default());
    let a = Peer {
        session: Session::connecting(
            b_addr,
            shared(&a_controller, Timestamp { secs: 10, nanos: 0 }),
            now,
        ),
        addr: a_addr,
        out: VecDeque::new(),
        timers: Vec::new(),
        controller: a_controller,
    };
    // B is created lazily from A's connect datagram, like a talker would
    let b = Peer {
        session: Session::connecting(
            a_addr,
            shared(&b_controller, Timestamp { secs: 20, nanos: 0 }),
            now,
        ),
        addr: b_addr,
        out: VecDeque::new(),
        timers: Vec::new(),
        controller: b_controller,
    };
    (a, b)
}

/// Move every queued datagram from `from` into `to`, except the ones the
/// filter rejects. Returns how many moved.
fn exchange(from: &mut Peer, to: &mut Peer, now: Instant, keep: &mut dyn FnMut(&[u8]) -> bool) -> usize {
    let mut moved = 0;
    while let Some(t) = from.out.pop_front() {
        if !keep(&t.bytes) {
            continue;
        }
        to.feed(now, &t.bytes);
        moved += 1;
    }
    moved
}

fn keep_all(_: &[u8]) -> bool {
    true
}

/// Drive both peers until quiescent or `rounds` exhausted, advancing the
/// clock by `step` each round.
fn run(a: &mut Peer, b: &mut Peer, now: &mut Instant, step: Duration, rounds: usize) {
    run_with_filter(a, b, now, step, rounds, &mut keep_all)
}

fn run_with_filter(
    a: &mut Peer,
    b: &mut Peer,
    now: &mut Instant,
    step: Duration,
    rounds: usize,
    keep: &mut dyn FnMut(&[u8]) -> bool,
) {
    for _ in 0..rounds {
        *now += step;
        a.fire_due_timers(*now);
        b.fire_due_timers(*now);
        a.execute(*now);
        b.execute(*now);
        let moved = exchange(a, b, *now, keep) + exchange(b, a, *now, &mut keep_all);
        a.execute(*now);
        b.execute(*now);
        let moved2 = exchange(a, b, *now, keep) + exchange(b, a, *now, &mut keep_all);
        // quiescent once nothing moves and nothing awaits acknowledgement
        if moved == 0
            && moved2 == 0
            && a.session.occupied_slot_count() == 0
            && b.session.occupied_slot_count() == 0
        {
            return;
        }
    }
}

/// The accepting side of the handshake, built from the first connect the
/// initiator emits; the datagram is replayed into the new session.
fn accept_handshake(a: &mut Peer, b: &mut Peer, now: Instant) {
    a.execute(now);
    let connect = a.out.pop_front().expect("connect emitted");
    let inbound = InboundPacket::parse(&connect.bytes).unwrap();
    assert_eq!(inbound.ptype, PacketType::Connect);
    let data = ConnectData::load(inbound.data()).unwrap();
    let b_shared = shared(&b.controller, Timestamp { secs: 20, nanos: 0 });
    b.session = Session::accepting(a.addr, &data, b_shared, now);
    b.feed(now, &connect.bytes);
}

#[test]
fn happy_path_large_message() {
    let mut now = Instant::now();
    let (mut a, mut b) = pair(now);
    accept_handshake(&mut a, &mut b, now);

    a.push("big", 1_000_000, 0);
    run(&mut a, &mut b, &mut now, Duration::from_millis(1), 4000);

    assert!(a.session.state().is_active());
    assert!(b.session.state().is_active());
    assert_eq!(b.controller.received_labels(), vec!["big".to_string()]);
    let completions = a.controller.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, "big");
    assert_eq!(completions[0].2, CompletionStatus::Success);
    // every slot acknowledged, every stub released
    assert_eq!(a.session.occupied_slot_count(), 0);
    assert_eq!(a.session.live_message_count(), 0);
}

#[test]
fn dropped_packet_is_retransmitted_without_duplicate_delivery() {
    let mut now = Instant::now();
    let (mut a, mut b) = pair(now);
    accept_handshake(&mut a, &mut b, now);

    a.push("lossy", 40_000, 0);

    // drop the third data packet once
    let mut data_seen = 0u32;
    let mut dropped = false;
    let mut filter = move |bytes: &[u8]| {
        let inbound = InboundPacket::parse(bytes).unwrap();
        if inbound.ptype == PacketType::Data && !inbound.data().is_empty() {
            data_seen += 1;
            if data_seen == 3 && !dropped {
                dropped = true;
                return false;
            }
        }
        true
    };
    run_with_filter(
        &mut a,
        &mut b,
        &mut now,
        Duration::from_millis(30),
        2000,
        &mut filter,
    );

    assert_eq!(b.controller.received_labels(), vec!["lossy".to_string()]);
    let completions = a.controller.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].2, CompletionStatus::Success);
}

#[test]
fn synchronous_messages_deliver_in_submission_order() {
    let mut now = Instant::now();
    let (mut a, mut b) = pair(now);
    accept_handshake(&mut a, &mut b, now);

    a.push("m1-sync", 10_000, flags::SYNCHRONOUS);
    a.push("m2-async", 10_000, 0);
    a.push("m3-sync", 10_000, flags::SYNCHRONOUS);
    run(&mut a, &mut b, &mut now, Duration::from_millis(1), 2000);

    let labels = b.controller.received_labels();
    assert_eq!(labels.len(), 3, "all three delivered: {labels:?}");
    let pos = |l: &str| labels.iter().position(|x| x == l).unwrap();
    assert!(
        pos("m1-sync") < pos("m3-sync"),
        "synchronous order violated: {labels:?}"
    );
    assert_eq!(a.controller.completions().len(), 3);
}

#[test]
fn peer_restart_detected_by_timestamp_mismatch() {
    let mut now = Instant::now();
    let (mut a, mut b) = pair(now);
    accept_handshake(&mut a, &mut b, now);
    // swallow B's accept: B "restarts" instead
    b.out.clear();

    a.push("doomed", 1_000, 0);

    // the restarted B only ever saw a connect from A's previous
    // incarnation, so its accept echoes a stale timestamp
    let restarted = Arc::new(Recording::default());
    let stale_connect = ConnectData::basic(a.addr.port(), Timestamp { secs: 77, nanos: 7 });
    let b2_shared = shared(&restarted, Timestamp { secs: 99, nanos: 9 });
    let mut b2 = Peer {
        session: Session::accepting(a.addr, &stale_connect, b2_shared, now),
        addr: b.addr,
        out: VecDeque::new(),
        timers: Vec::new(),
        controller: restarted,
    };
    b2.execute(now);
    exchange(&mut b2, &mut a, now, &mut keep_all);

    assert!(a.session.is_dead(), "mismatched accept kills the session");
    let completions = a.controller.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, "doomed");
    assert_eq!(completions[0].2, CompletionStatus::NotSent);
    assert_eq!(a.session.live_message_count(), 0);
    assert_eq!(a.session.occupied_slot_count(), 0);
}

#[test]
fn request_response_correlation() {
    let mut now = Instant::now();
    let (mut a, mut b) = pair(now);
    accept_handshake(&mut a, &mut b, now);

    a.push("request", 2_000, flags::WAIT_RESPONSE);
    run(&mut a, &mut b, &mut now, Duration::from_millis(1), 500);

    // request delivered but not yet completed on A
    assert_eq!(b.controller.received_labels(), vec!["request".to_string()]);
    assert!(a.controller.completions().is_empty());
    assert_eq!(a.session.wait_response_count(), 1);

    // B answers using the request uid from the delivery context
    let request_uid = {
        let received = b.controller.received.lock().unwrap();
        let ctx = received[0].1;
        assert!(ctx.request_uid.is_valid());
        ctx.request_uid
    };
    let reply = Arc::new(Blob {
        label: "reply".into(),
        payload: "y".repeat(500),
    });
    b.session
        .push_message(reply, BLOB_TYPE, flags::RESPONSE, request_uid)
        .unwrap();
    run(&mut a, &mut b, &mut now, Duration::from_millis(1), 500);

    let completions = a.controller.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(
        completions[0],
        (
            "request".to_string(),
            Some("reply".to_string()),
            CompletionStatus::Success
        )
    );
    assert_eq!(a.session.wait_response_count(), 0);
    assert_eq!(a.session.live_message_count(), 0);
}

#[test]
fn cancellation_is_idempotent() {
    let mut now = Instant::now();
    let (mut a, mut b) = pair(now);
    accept_handshake(&mut a, &mut b, now);

    let uid = a.push("canceled", 50_000, 0);
    a.session.cancel_message(uid);
    a.session.cancel_message(uid); // second cancel is a no-op
    run(&mut a, &mut b, &mut now, Duration::from_millis(1), 200);

    let completions = a.controller.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].2, CompletionStatus::Canceled);
    assert!(b.controller.received_labels().is_empty());

    // cancelling a completed message is a no-op too
    a.session.cancel_message(uid);
    assert_eq!(a.controller.completions().len(), 1);
}

#[test]
fn mid_flight_cancellation_reaches_peer() {
    let mut now = Instant::now();
    let (mut a, mut b) = pair(now);
    accept_handshake(&mut a, &mut b, now);

    let uid = a.push("partial", 200_000, 0);
    // move a few packets, then cancel with fragments outstanding
    for _ in 0..3 {
        now += Duration::from_millis(1);
        a.execute(now);
        exchange(&mut a, &mut b, now, &mut keep_all);
        b.execute(now);
        exchange(&mut b, &mut a, now, &mut keep_all);
    }
    a.session.cancel_message(uid);
    run(&mut a, &mut b, &mut now, Duration::from_millis(1), 200);

    let completions = a.controller.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].2, CompletionStatus::Canceled);
    // the peer never delivers the truncated message
    assert!(b.controller.received_labels().is_empty());
    assert_eq!(a.session.live_message_count(), 0);
}

#[test]
fn retransmit_budget_exhaustion_tears_the_session_down() {
    let mut now = Instant::now();
    let (mut a, mut b) = pair(now);
    accept_handshake(&mut a, &mut b, now);
    run(&mut a, &mut b, &mut now, Duration::from_millis(1), 50);

    a.push("void", 5_000, 0);
    // the peer goes silent: drop everything A sends, fire every timer
    for _ in 0..200 {
        now += Duration::from_secs(60);
        a.execute(now);
        a.out.clear();
        a.fire_due_timers(now);
        if a.session.is_dead() {
            break;
        }
    }

    assert!(a.session.is_dead());
    let completions = a.controller.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].2, CompletionStatus::NotSent);
    assert_eq!(a.session.occupied_slot_count(), 0);
    assert_eq!(a.session.live_message_count(), 0);
}

#[test]
fn sent_request_completes_no_response_on_teardown() {
    let mut now = Instant::now();
    let (mut a, mut b) = pair(now);
    accept_handshake(&mut a, &mut b, now);

    a.push("waiting", 1_000, flags::WAIT_RESPONSE);
    run(&mut a, &mut b, &mut now, Duration::from_millis(1), 200);
    assert_eq!(a.session.wait_response_count(), 1);

    a.session.teardown(CompletionStatus::NotSent);
    let completions = a.controller.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].2, CompletionStatus::SentNoResponse);
    assert_eq!(a.session.live_message_count(), 0);
    assert_eq!(a.session.occupied_slot_count(), 0);
}
