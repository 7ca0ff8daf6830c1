//! Reliable multiplexed message transport over UDP.
//!
//! This crate turns an unreliable datagram socket into a reliable,
//! ordered, multiplexed carrier of typed application messages: bounded
//! in-flight windows, retransmission with backoff, acknowledgement
//! piggy-backing, request/response correlation, keep-alive, graceful
//! close and optional relaying through gateway processes for networks
//! that cannot be reached directly.
//!
//! # Layers
//!
//! - [`ipc::packet`] - wire framing, sequence ids, update vectors
//! - [`ipc::session`] - the per-peer protocol state machine (sans-I/O)
//! - [`ipc::service`] - talkers, the session registry, the public API
//! - [`ipc::protocol`] - the pluggable message codec boundary
//!
//! # Features
//!
//! - `json-codec` - serde_json-backed [`ipc::JsonProtocol`]
//! - `full` - all features enabled
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mlink::ipc::{ChannelService, Configuration, JsonProtocol};
//!
//! #[tokio::main]
//! async fn main() -> mlink::ipc::Result<()> {
//!     let mut protocol = JsonProtocol::new();
//!     protocol.register::<EchoMessage>(1);
//!
//!     let config = Configuration::new("0.0.0.0:4500".parse().unwrap());
//!     let mut node = ChannelService::start(config, Arc::new(protocol)).await?;
//!
//!     while let Some(incoming) = node.incoming.recv().await {
//!         // echo everything back on the same session
//!         node.service.send_message_to(
//!             incoming.ctx.connection,
//!             incoming.msg,
//!             1,
//!             0,
//!         )?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Delivery guarantees
//!
//! Within one session, messages submitted with the synchronous flag are
//! observed by the peer in submission order; asynchronous messages may
//! overtake each other but never a synchronous message already on the
//! wire. Every submitted message is completed exactly once: delivered on
//! the peer, or completed locally with a status saying why not.

pub mod ipc;
pub mod util;

// Re-export common types at crate root for convenience
pub use ipc::{
    CompletionStatus, Configuration, ConnectionUid, Error, Message, MessageUid, Result, Service,
};
