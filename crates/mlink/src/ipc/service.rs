//! Process-wide service: talker ownership, session admission and the
//! public messaging API.
//!
//! The service holds the registry mapping peer addresses to sessions and
//! creates talkers on demand. The registry mutex is acquired for lookups
//! and admission only; all protocol work happens inside talkers. Lock
//! order is registry before talker core, everywhere.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, info};

use super::config::Configuration;
use super::controller::{ChannelController, CompletedMessage, Controller, IncomingMessage};
use super::error::{Error, Result};
use super::handshake::Timestamp;
use super::node::Node;
use super::protocol::{Message, MessageTypeId, MessageUid, Protocol, flags};
use super::session::{Session, SessionShared};
use super::talker::{Admission, Removal, Talker};
use crate::util::addr::{BaseAddress, RelayAddress};

/// Public handle to one session: talker slot, session slot and a reuse
/// counter defeating ABA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionUid {
    pub talker_index: u16,
    pub session_index: u16,
    pub unique: u32,
}

impl ConnectionUid {
    pub const INVALID: ConnectionUid = ConnectionUid {
        talker_index: u16::MAX,
        session_index: u16::MAX,
        unique: u32::MAX,
    };

    pub fn is_valid(&self) -> bool {
        self.talker_index != u16::MAX
    }
}

impl std::fmt::Display for ConnectionUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}:{}",
            self.talker_index, self.session_index, self.unique
        )
    }
}

struct TalkerEntry {
    talker: Arc<Talker>,
    session_count: u32,
}

/// The address-to-session map shared between the service and its talkers.
pub(crate) struct Registry {
    talkers: Vec<TalkerEntry>,
    by_base: HashMap<BaseAddress, ConnectionUid>,
    by_relay: HashMap<RelayAddress, ConnectionUid>,
    /// Round-robin cursor for force-assignment.
    crt_talker: usize,
}

impl Registry {
    fn new() -> Self {
        Self {
            talkers: Vec::new(),
            by_base: HashMap::new(),
            by_relay: HashMap::new(),
            crt_talker: 0,
        }
    }

    pub(crate) fn admit_session(&mut self, admission: &Admission) {
        match admission.relay {
            Some(relay) => {
                self.by_relay.insert(relay, admission.uid);
            }
            None => {
                self.by_base.insert(admission.base, admission.uid);
            }
        }
        if let Some(entry) = self.talkers.get_mut(admission.uid.talker_index as usize) {
            entry.session_count += 1;
        }
    }

    pub(crate) fn remove_session(&mut self, removal: &Removal) {
        match removal.relay {
            Some(relay) => {
                if self.by_relay.get(&relay) == Some(&removal.uid) {
                    self.by_relay.remove(&relay);
                }
            }
            None => {
                if self.by_base.get(&removal.base) == Some(&removal.uid) {
                    self.by_base.remove(&removal.base);
                }
            }
        }
        if let Some(entry) = self.talkers.get_mut(removal.uid.talker_index as usize) {
            entry.session_count = entry.session_count.saturating_sub(1);
        }
    }

    fn talker(&self, index: u16) -> Option<Arc<Talker>> {
        self.talkers.get(index as usize).map(|e| Arc::clone(&e.talker))
    }
}

struct ServiceInner {
    config: Arc<Configuration>,
    shared: SessionShared,
    registry: Arc<Mutex<Registry>>,
    stopped: AtomicBool,
}

/// The IPC service. Cheap to clone; all clones drive the same talkers.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Start the service: validate the configuration, bind the accepting
    /// talker and capture the startup timestamp.
    pub async fn start(
        mut config: Configuration,
        protocol: Arc<dyn Protocol>,
        controller: Arc<dyn Controller>,
    ) -> Result<Service> {
        config.prepare()?;
        let config = Arc::new(config);
        let shared = SessionShared {
            config: Arc::clone(&config),
            protocol,
            controller,
            timestamp: Timestamp::now(),
        };
        let registry = Arc::new(Mutex::new(Registry::new()));
        let inner = Arc::new(ServiceInner {
            config: Arc::clone(&config),
            shared,
            registry,
            stopped: AtomicBool::new(false),
        });
        let service = Service { inner };

        // talker 0 listens on the advertised base address; relay
        // forwarding lives there too when this process is a gateway
        let socket = UdpSocket::bind(service.inner.config.accept_address()).await?;
        let node = service
            .inner
            .config
            .is_gateway()
            .then(|| Node::new(service.inner.config.node.session_count as usize));
        service.add_talker(socket, node)?;
        info!(address = %service.inner.config.accept_address(), "service started");
        Ok(service)
    }

    fn add_talker(&self, socket: UdpSocket, node: Option<Node>) -> Result<Arc<Talker>> {
        let mut registry = self.registry_lock();
        let index = registry.talkers.len() as u16;
        let talker = Talker::spawn(
            index,
            socket,
            self.inner.shared.clone(),
            Arc::clone(&self.inner.registry),
            node,
        )?;
        registry.talkers.push(TalkerEntry {
            talker: Arc::clone(&talker),
            session_count: 0,
        });
        debug!(talker = index, port = talker.base_port, "talker added");
        Ok(talker)
    }

    fn registry_lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.registry.lock().expect("registry poisoned")
    }

    /// The configuration the service runs with.
    pub fn configuration(&self) -> &Configuration {
        &self.inner.config
    }

    /// The startup timestamp echoed through handshakes.
    pub fn timestamp(&self) -> Timestamp {
        self.inner.shared.timestamp
    }

    /// Number of sessions known to the registry.
    pub fn session_count(&self) -> usize {
        let registry = self.registry_lock();
        registry.by_base.len() + registry.by_relay.len()
    }

    /// Send a message to a peer in the local network, creating the
    /// session (and possibly a talker) on first use.
    pub async fn send_message(
        &self,
        peer: SocketAddr,
        msg: Arc<dyn Message>,
        type_id: MessageTypeId,
        msg_flags: u32,
    ) -> Result<(ConnectionUid, MessageUid)> {
        self.send_message_inner(peer, None, msg, type_id, msg_flags)
            .await
    }

    /// Send a message to a peer in another network through a configured
    /// gateway.
    pub async fn send_message_relayed(
        &self,
        peer: SocketAddr,
        network_id: u32,
        msg: Arc<dyn Message>,
        type_id: MessageTypeId,
        msg_flags: u32,
    ) -> Result<(ConnectionUid, MessageUid)> {
        self.send_message_inner(peer, Some(network_id), msg, type_id, msg_flags)
            .await
    }

    async fn send_message_inner(
        &self,
        peer: SocketAddr,
        network_id: Option<u32>,
        msg: Arc<dyn Message>,
        type_id: MessageTypeId,
        msg_flags: u32,
    ) -> Result<(ConnectionUid, MessageUid)> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::ServiceStopped);
        }
        if peer.is_ipv4() != self.inner.config.base_address.is_ipv4() {
            return Err(Error::UnsupportedSocketFamily { address: peer });
        }
        let base = BaseAddress::from(peer);

        // fast path: an existing session
        let existing = {
            let registry = self.registry_lock();
            match network_id {
                Some(net) => registry
                    .by_relay
                    .get(&RelayAddress::new(base, net))
                    .copied(),
                None => registry.by_base.get(&base).copied(),
            }
            .and_then(|uid| registry.talker(uid.talker_index).map(|t| (uid, t)))
        };
        if let Some((uid, talker)) = existing {
            match talker.with_core(|core| {
                core.push_message(uid, Arc::clone(&msg), type_id, msg_flags, MessageUid::INVALID)
            }) {
                Ok(msg_uid) => return Ok((uid, msg_uid)),
                Err(Error::NoConnection) => {
                    // stale mapping; fall through and build a new session
                }
                Err(e) => return Err(e),
            }
        }

        let mut registry = self.registry_lock();
        let talker = self.pick_talker(&mut registry)?;
        let now = std::time::Instant::now();
        let (uid, msg_uid) = talker.with_core(|core| -> Result<_> {
            let session = match network_id {
                Some(net) => {
                    let token = core.take_relay_token();
                    Session::relay_connecting(peer, net, token, self.inner.shared.clone(), now)?
                }
                None => Session::connecting(peer, self.inner.shared.clone(), now),
            };
            let uid = core.insert_session(session);
            let msg_uid =
                core.push_message(uid, msg, type_id, msg_flags, MessageUid::INVALID)?;
            Ok((uid, msg_uid))
        })?;
        match network_id {
            Some(net) => {
                registry.by_relay.insert(RelayAddress::new(base, net), uid);
            }
            None => {
                registry.by_base.insert(base, uid);
            }
        }
        if let Some(entry) = registry.talkers.get_mut(uid.talker_index as usize) {
            entry.session_count += 1;
        }
        Ok((uid, msg_uid))
    }

    /// Talker allocation: prefer free capacity, then create up to the
    /// configured maximum, then round-robin force-assign.
    fn pick_talker(&self, registry: &mut Registry) -> Result<Arc<Talker>> {
        let per_talker = self.inner.config.talker.session_count;
        if let Some(entry) = registry
            .talkers
            .iter()
            .find(|e| e.session_count < per_talker)
        {
            return Ok(Arc::clone(&entry.talker));
        }
        if (registry.talkers.len() as u32) < self.inner.config.talker.max_count {
            let bind = SocketAddr::new(self.inner.config.base_address.ip(), 0);
            let socket = bind_nonblocking(bind)?;
            let index = registry.talkers.len() as u16;
            let talker = Talker::spawn(
                index,
                socket,
                self.inner.shared.clone(),
                Arc::clone(&self.inner.registry),
                None,
            )?;
            registry.talkers.push(TalkerEntry {
                talker: Arc::clone(&talker),
                session_count: 0,
            });
            debug!(talker = index, "overflow talker added");
            return Ok(talker);
        }
        if registry.talkers.is_empty() {
            return Err(Error::ServiceStopped);
        }
        registry.crt_talker = (registry.crt_talker + 1) % registry.talkers.len();
        Ok(Arc::clone(&registry.talkers[registry.crt_talker].talker))
    }

    /// Send a message on an already-established session.
    pub fn send_message_to(
        &self,
        connection: ConnectionUid,
        msg: Arc<dyn Message>,
        type_id: MessageTypeId,
        msg_flags: u32,
    ) -> Result<MessageUid> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::ServiceStopped);
        }
        let talker = self
            .registry_lock()
            .talker(connection.talker_index)
            .ok_or(Error::NoConnection)?;
        talker.with_core(|core| {
            core.push_message(connection, msg, type_id, msg_flags, MessageUid::INVALID)
        })
    }

    /// Answer a request received with the wait-response flag. The
    /// `request_uid` comes from the delivery context.
    pub fn respond(
        &self,
        connection: ConnectionUid,
        request_uid: MessageUid,
        msg: Arc<dyn Message>,
        type_id: MessageTypeId,
        msg_flags: u32,
    ) -> Result<MessageUid> {
        if !request_uid.is_valid() {
            return Err(Error::NoConnection);
        }
        let talker = self
            .registry_lock()
            .talker(connection.talker_index)
            .ok_or(Error::NoConnection)?;
        talker.with_core(|core| {
            core.push_message(
                connection,
                msg,
                type_id,
                msg_flags | flags::RESPONSE,
                request_uid,
            )
        })
    }

    /// Cancel a message previously submitted on `connection`.
    pub fn cancel_message(&self, connection: ConnectionUid, msg_uid: MessageUid) -> Result<()> {
        let talker = self
            .registry_lock()
            .talker(connection.talker_index)
            .ok_or(Error::NoConnection)?;
        talker.with_core(|core| core.cancel_message(connection, msg_uid))
    }

    /// Close one session gracefully.
    pub fn disconnect(&self, connection: ConnectionUid) -> Result<()> {
        let talker = self
            .registry_lock()
            .talker(connection.talker_index)
            .ok_or(Error::NoConnection)?;
        talker.with_core(|core| core.disconnect(connection))
    }

    /// Stop the service: every session is torn down with its messages
    /// completed, every talker task exits.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let talkers: Vec<Arc<Talker>> = {
            let registry = self.registry_lock();
            registry
                .talkers
                .iter()
                .map(|e| Arc::clone(&e.talker))
                .collect()
        };
        for talker in talkers {
            talker.stop();
        }
        info!("service stopped");
    }
}

fn bind_nonblocking(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

/// Convenience bundle for channel-driven applications: the service plus
/// streams of deliveries and completions.
pub struct ChannelService {
    pub service: Service,
    pub incoming: MessageStream,
    pub completed: mpsc::UnboundedReceiver<CompletedMessage>,
}

impl ChannelService {
    /// Start a service wired to a [`ChannelController`].
    pub async fn start(
        config: Configuration,
        protocol: Arc<dyn Protocol>,
    ) -> Result<ChannelService> {
        let (controller, incoming, completed) = ChannelController::new();
        let service = Service::start(config, protocol, Arc::new(controller)).await?;
        Ok(ChannelService {
            service,
            incoming: MessageStream { rx: incoming },
            completed,
        })
    }
}

/// Stream of delivered inbound messages.
///
/// Implements [`Stream`], so the tokio-stream combinators apply:
///
/// ```ignore
/// use tokio_stream::StreamExt;
///
/// while let Some(incoming) = stream.next().await {
///     println!("{:?}", incoming.msg);
/// }
/// ```
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<IncomingMessage>,
}

impl MessageStream {
    /// Receive the next delivered message.
    pub async fn recv(&mut self) -> Option<IncomingMessage> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = IncomingMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_uid_validity() {
        assert!(!ConnectionUid::INVALID.is_valid());
        let uid = ConnectionUid {
            talker_index: 0,
            session_index: 3,
            unique: 1,
        };
        assert!(uid.is_valid());
        assert_eq!(uid.to_string(), "0/3:1");
    }

    #[test]
    fn registry_admission_and_removal() {
        let mut registry = Registry::new();
        let base = BaseAddress::new("10.0.0.1".parse().unwrap(), 4500);
        let uid = ConnectionUid {
            talker_index: 0,
            session_index: 0,
            unique: 0,
        };
        registry.admit_session(&Admission {
            base,
            relay: None,
            uid,
        });
        assert_eq!(registry.by_base.get(&base), Some(&uid));

        // removal with a stale uid must not clobber a newer mapping
        let newer = ConnectionUid {
            unique: 1,
            ..uid
        };
        registry.by_base.insert(base, newer);
        registry.remove_session(&Removal {
            base,
            relay: None,
            uid,
        });
        assert_eq!(registry.by_base.get(&base), Some(&newer));

        registry.remove_session(&Removal {
            base,
            relay: None,
            uid: newer,
        });
        assert!(registry.by_base.is_empty());
    }
}
