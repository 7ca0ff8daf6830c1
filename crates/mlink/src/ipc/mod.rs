//! Reliable, multiplexed, message-oriented transport over UDP.
//!
//! The engine layers four components over one unreliable datagram socket:
//! packets (framing, sequencing, acknowledgement), sessions (the per-peer
//! reliability and multiplex state machine), talkers (one socket, many
//! sessions) and the service (process-wide registry and public API).
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mlink::ipc::{ChannelService, Configuration, JsonProtocol};
//!
//! let mut protocol = JsonProtocol::new();
//! protocol.register::<PingMessage>(1);
//!
//! let config = Configuration::new("0.0.0.0:4500".parse()?);
//! let mut node = ChannelService::start(config, Arc::new(protocol)).await?;
//!
//! node.service
//!     .send_message("10.0.0.9:4500".parse()?, Arc::new(ping), 1, 0)
//!     .await?;
//! while let Some(incoming) = node.incoming.recv().await {
//!     println!("{:?}", incoming.msg);
//! }
//! ```

pub mod config;
pub mod controller;
mod error;
pub mod handshake;
mod node;
pub mod packet;
pub mod protocol;
pub mod service;
pub mod session;
mod talker;

pub use config::{Configuration, NodeConfig, SessionConfig, TalkerConfig};
pub use controller::{
    AuthResult, ChannelController, CompletedMessage, ConnectionContext, Controller,
    IncomingMessage,
};
pub use error::{CompletionStatus, Error, Result};
pub use handshake::Timestamp;
pub use protocol::{
    Deserializer, Message, MessageTypeId, MessageUid, Protocol, Serializer, downcast, flags,
};
#[cfg(feature = "json-codec")]
pub use protocol::JsonProtocol;
pub use service::{ChannelService, ConnectionUid, MessageStream, Service};
