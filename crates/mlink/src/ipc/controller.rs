//! Application hooks.
//!
//! The engine reports everything that happens to messages through a
//! [`Controller`]: deliveries, completions, authentication and the optional
//! per-packet compression. Hooks run on the talker task and must not
//! block.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::error::CompletionStatus;
use super::protocol::{Message, MessageTypeId, MessageUid};
use super::service::ConnectionUid;

/// Context handed to every controller hook.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionContext {
    /// Handle of the session the event belongs to.
    pub connection: ConnectionUid,
    /// The peer's datagram address.
    pub peer_address: SocketAddr,
    /// For inbound requests: the uid to echo when responding. Invalid
    /// otherwise.
    pub request_uid: MessageUid,
}

/// Verdict of an authentication round.
pub enum AuthResult {
    /// Authentication succeeded; the session becomes active. An optional
    /// reply message is sent first.
    Accept(Option<(Arc<dyn Message>, MessageTypeId)>),
    /// More rounds are needed; the reply continues the exchange.
    Continue(Arc<dyn Message>, MessageTypeId),
    /// The peer is refused; the session is torn down.
    Reject,
}

/// Application-side hooks driven by the engine.
///
/// All methods have working defaults except [`Controller::on_receive`]; a
/// minimal application only decides what to do with inbound messages.
pub trait Controller: Send + Sync {
    /// A complete message arrived on a session.
    fn on_receive(&self, ctx: &ConnectionContext, msg: Arc<dyn Message>);

    /// A submitted message reached its final state. For requests completed
    /// by a response, `response` carries it.
    fn on_complete(
        &self,
        ctx: &ConnectionContext,
        msg: Arc<dyn Message>,
        response: Option<Arc<dyn Message>>,
        status: CompletionStatus,
    ) {
        let _ = (ctx, msg, response, status);
    }

    /// Called when a message moves from the pending FIFO into the active
    /// send queue; the returned bits are OR-ed into the message flags
    /// (typically [`super::protocol::flags::WAIT_RESPONSE`]).
    fn on_prepare(&self, ctx: &ConnectionContext, msg: &dyn Message) -> u32 {
        let _ = (ctx, msg);
        0
    }

    /// True when accepted sessions must authenticate before going active.
    fn authentication_required(&self) -> bool {
        false
    }

    /// Judge one authentication message. Only called while a session is in
    /// the authenticating state.
    fn authenticate(&self, ctx: &ConnectionContext, msg: Arc<dyn Message>) -> AuthResult {
        let _ = (ctx, msg);
        AuthResult::Reject
    }

    /// Offer a packet data area for compression. Return the compressed
    /// size when `out` now holds a smaller representation, `None` to send
    /// the original bytes.
    fn compress(&self, data: &[u8], out: &mut [u8]) -> Option<usize> {
        let _ = (data, out);
        None
    }

    /// Reverse [`Controller::compress`]. Returns the decompressed size.
    fn decompress(
        &self,
        data: &[u8],
        out: &mut Vec<u8>,
    ) -> super::error::Result<usize> {
        let _ = data;
        let _ = out;
        Err(super::error::Error::InvalidPacket(
            "compressed packet but no decompressor installed".into(),
        ))
    }
}

/// A delivered inbound message, as forwarded by [`ChannelController`].
#[derive(Debug)]
pub struct IncomingMessage {
    pub ctx: ConnectionContext,
    pub msg: Arc<dyn Message>,
}

/// A completion event, as forwarded by [`ChannelController`].
#[derive(Debug)]
pub struct CompletedMessage {
    pub ctx: ConnectionContext,
    pub msg: Arc<dyn Message>,
    pub response: Option<Arc<dyn Message>>,
    pub status: CompletionStatus,
}

/// A [`Controller`] that forwards deliveries and completions into
/// channels, for applications that prefer pulling messages over
/// implementing hooks.
pub struct ChannelController {
    incoming: mpsc::UnboundedSender<IncomingMessage>,
    completed: mpsc::UnboundedSender<CompletedMessage>,
}

impl ChannelController {
    /// Build the controller plus the receiving ends.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<IncomingMessage>,
        mpsc::UnboundedReceiver<CompletedMessage>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: in_tx,
                completed: done_tx,
            },
            in_rx,
            done_rx,
        )
    }
}

impl Controller for ChannelController {
    fn on_receive(&self, ctx: &ConnectionContext, msg: Arc<dyn Message>) {
        let _ = self.incoming.send(IncomingMessage { ctx: *ctx, msg });
    }

    fn on_complete(
        &self,
        ctx: &ConnectionContext,
        msg: Arc<dyn Message>,
        response: Option<Arc<dyn Message>>,
        status: CompletionStatus,
    ) {
        let _ = self.completed.send(CompletedMessage {
            ctx: *ctx,
            msg,
            response,
            status,
        });
    }
}
