//! Message model and the pluggable codec boundary.
//!
//! The engine never inspects message payloads. It stores `(type id, opaque
//! handle, flags)` and moves bytes between a [`Serializer`] and the wire on
//! one side, the wire and a [`Deserializer`] on the other. A [`Protocol`]
//! maps type ids to codec factories; the crate ships a serde_json-backed
//! implementation behind the `json-codec` feature.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::error::Result;

/// Serialization type id resolved through the protocol map.
pub type MessageTypeId = u32;

/// Reserved invalid type id.
pub const INVALID_TYPE_ID: MessageTypeId = 0;

/// Message flag bits. The low half is wire-visible; the high half is
/// engine-internal bookkeeping and never leaves the process.
pub mod flags {
    /// Serialization of this message may not interleave with another
    /// synchronous message on the same session.
    pub const SYNCHRONOUS: u32 = 1 << 0;
    /// Keep the stub after sending; a correlated response will complete it.
    pub const WAIT_RESPONSE: u32 = 1 << 1;
    /// Tear the session down once this message is fully sent.
    pub const DISCONNECT_AFTER_SEND: u32 = 1 << 2;
    /// Drop instead of re-queueing across a reconnect cycle.
    pub const ONE_SHOT: u32 = 1 << 3;
    /// Carries authentication data; the only traffic allowed while a
    /// session authenticates.
    pub const AUTHENTICATION: u32 = 1 << 4;
    /// Safe to resend after a reconnect.
    pub const IDEMPOTENT: u32 = 1 << 5;
    /// This message answers an earlier request.
    pub const RESPONSE: u32 = 1 << 6;
    /// The sender canceled this message mid-flight.
    pub const CANCELED: u32 = 1 << 7;

    /// Set once serialization has begun.
    pub const STARTED: u32 = 1 << 16;
    /// Set once the final fragment was acknowledged.
    pub const SENT: u32 = 1 << 17;
    /// Set once the message moved from the pending FIFO into the active
    /// send queue.
    pub const ACTIVE: u32 = 1 << 18;

    /// Bits that may travel in a message head.
    pub const WIRE_MASK: u32 = 0xffff;
}

/// Handle to a submitted message: slot index plus a unique counter that
/// invalidates stale references once the slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageUid {
    pub index: u32,
    pub unique: u32,
}

impl MessageUid {
    pub const INVALID: MessageUid = MessageUid {
        index: u32::MAX,
        unique: u32::MAX,
    };

    pub fn new(index: u32, unique: u32) -> Self {
        Self { index, unique }
    }

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }
}

impl Default for MessageUid {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for MessageUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.unique)
    }
}

/// An application message moved through the engine as an opaque handle.
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// Downcast support for applications receiving `Arc<dyn Message>`.
    fn as_any(&self) -> &dyn Any;
}

/// Convenience downcast for received messages.
pub fn downcast<T: Message>(msg: &Arc<dyn Message>) -> Option<&T> {
    msg.as_any().downcast_ref::<T>()
}

/// Incremental producer of one message's serialized bytes.
///
/// `fill` is called with whatever window the current packet has left; a
/// serializer must make progress whenever the window is non-empty and
/// report completion once its stream is exhausted.
pub trait Serializer: Send {
    /// Write up to `buf.len()` bytes, returning how many were produced.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// True once every byte of the message has been produced.
    fn is_complete(&self) -> bool;
}

/// Incremental consumer reassembling one message from fragments.
pub trait Deserializer: Send {
    /// Feed the next contiguous chunk of the message stream.
    fn consume(&mut self, bytes: &[u8]) -> Result<()>;

    /// Finish the stream and build the message.
    fn finish(&mut self) -> Result<Arc<dyn Message>>;
}

/// The codec boundary: maps type ids to serializer/deserializer factories.
pub trait Protocol: Send + Sync {
    /// Create a serializer for an outbound message.
    fn serializer(
        &self,
        type_id: MessageTypeId,
        msg: &Arc<dyn Message>,
    ) -> Result<Box<dyn Serializer>>;

    /// Create a deserializer for an inbound message of `type_id`.
    fn deserializer(&self, type_id: MessageTypeId) -> Result<Box<dyn Deserializer>>;
}

#[cfg(feature = "json-codec")]
pub use json::JsonProtocol;

#[cfg(feature = "json-codec")]
mod json {
    //! serde_json-backed codec.

    use std::collections::HashMap;
    use std::sync::Arc;

    use serde::Serialize;
    use serde::de::DeserializeOwned;

    use super::{
        Deserializer, INVALID_TYPE_ID, Message, MessageTypeId, Protocol, Serializer, downcast,
    };
    use crate::ipc::error::{Error, Result};

    type SerializeFn = Box<dyn Fn(&Arc<dyn Message>) -> Result<Vec<u8>> + Send + Sync>;
    type DeserializeFn = Arc<dyn Fn(&[u8]) -> Result<Arc<dyn Message>> + Send + Sync>;

    /// A [`Protocol`] serializing registered message types as JSON.
    ///
    /// Types register under a caller-chosen non-zero id:
    ///
    /// ```ignore
    /// let mut proto = JsonProtocol::new();
    /// proto.register::<PingMessage>(1);
    /// proto.register::<StoreMessage>(2);
    /// let proto = Arc::new(proto);
    /// ```
    #[derive(Default)]
    pub struct JsonProtocol {
        entries: HashMap<MessageTypeId, (SerializeFn, DeserializeFn)>,
    }

    impl JsonProtocol {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a message type under `type_id`.
        ///
        /// # Panics
        ///
        /// Panics on a zero or duplicate id; registration happens once at
        /// startup and a collision is a programming error.
        pub fn register<T>(&mut self, type_id: MessageTypeId) -> &mut Self
        where
            T: Message + Serialize + DeserializeOwned,
        {
            assert_ne!(type_id, INVALID_TYPE_ID, "type id 0 is reserved");
            let ser: SerializeFn = Box::new(|msg| {
                let typed = downcast::<T>(msg)
                    .ok_or_else(|| Error::Codec("message type mismatch".into()))?;
                serde_json::to_vec(typed).map_err(|e| Error::Codec(e.to_string()))
            });
            let de: DeserializeFn = Arc::new(|bytes| {
                let typed: T =
                    serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))?;
                Ok(Arc::new(typed) as Arc<dyn Message>)
            });
            let prev = self.entries.insert(type_id, (ser, de));
            assert!(prev.is_none(), "duplicate type id {type_id}");
            self
        }
    }

    impl Protocol for JsonProtocol {
        fn serializer(
            &self,
            type_id: MessageTypeId,
            msg: &Arc<dyn Message>,
        ) -> Result<Box<dyn Serializer>> {
            let (ser, _) = self
                .entries
                .get(&type_id)
                .ok_or(Error::UnknownMessageType(type_id))?;
            let bytes = ser(msg)?;
            Ok(Box::new(JsonSerializer { bytes, offset: 0 }))
        }

        fn deserializer(&self, type_id: MessageTypeId) -> Result<Box<dyn Deserializer>> {
            let (_, de) = self
                .entries
                .get(&type_id)
                .ok_or(Error::UnknownMessageType(type_id))?;
            Ok(Box::new(JsonDeserializer {
                build: Arc::clone(de),
                bytes: Vec::new(),
            }))
        }
    }

    struct JsonSerializer {
        bytes: Vec<u8>,
        offset: usize,
    }

    impl Serializer for JsonSerializer {
        fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.bytes.len() - self.offset);
            buf[..n].copy_from_slice(&self.bytes[self.offset..self.offset + n]);
            self.offset += n;
            Ok(n)
        }

        fn is_complete(&self) -> bool {
            self.offset == self.bytes.len()
        }
    }

    struct JsonDeserializer {
        build: DeserializeFn,
        bytes: Vec<u8>,
    }

    impl Deserializer for JsonDeserializer {
        fn consume(&mut self, bytes: &[u8]) -> Result<()> {
            self.bytes.extend_from_slice(bytes);
            Ok(())
        }

        fn finish(&mut self) -> Result<Arc<dyn Message>> {
            (self.build)(&self.bytes)
        }
    }
}

#[cfg(all(test, feature = "json-codec"))]
mod json_tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        seq: u64,
        body: String,
    }

    impl Message for Ping {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn chunked_roundtrip() {
        let mut proto = JsonProtocol::new();
        proto.register::<Ping>(1);

        let msg: Arc<dyn Message> = Arc::new(Ping {
            seq: 9,
            body: "x".repeat(300),
        });
        let mut ser = proto.serializer(1, &msg).unwrap();
        let mut de = proto.deserializer(1).unwrap();

        let mut chunk = [0u8; 48];
        while !ser.is_complete() {
            let n = ser.fill(&mut chunk).unwrap();
            de.consume(&chunk[..n]).unwrap();
        }
        let out = de.finish().unwrap();
        let out = downcast::<Ping>(&out).unwrap();
        assert_eq!(out.seq, 9);
        assert_eq!(out.body.len(), 300);
    }

    #[test]
    fn unknown_type_rejected() {
        let proto = JsonProtocol::new();
        assert!(proto.deserializer(77).is_err());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_validity() {
        assert!(!MessageUid::INVALID.is_valid());
        assert!(MessageUid::new(0, 0).is_valid());
    }

    #[test]
    fn wire_mask_excludes_internal_flags() {
        assert_eq!(flags::STARTED & flags::WIRE_MASK, 0);
        assert_eq!(flags::SENT & flags::WIRE_MASK, 0);
        assert_ne!(flags::SYNCHRONOUS & flags::WIRE_MASK, 0);
        assert_ne!(flags::CANCELED & flags::WIRE_MASK, 0);
    }
}
