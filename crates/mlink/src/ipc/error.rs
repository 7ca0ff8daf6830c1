//! Error types for the IPC engine.

use std::io;

/// Result type for IPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the IPC engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration is unusable; the service refuses to start.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A relayed session was requested but no gateway address is configured.
    #[error("no gateway configured for network {network_id}")]
    NoGateway {
        /// The unreachable network.
        network_id: u32,
    },

    /// The peer address family is not supported by the session type.
    #[error("unsupported socket family for {address}")]
    UnsupportedSocketFamily {
        /// The offending address.
        address: std::net::SocketAddr,
    },

    /// The connection handle does not name a live session.
    #[error("no such connection")]
    NoConnection,

    /// The peer restarted; the session was torn down and may be re-established.
    #[error("peer restarted, try reconnect")]
    TryReconnect,

    /// The service is stopped; no messages are accepted.
    #[error("service is stopped")]
    ServiceStopped,

    /// A send queue reached its bound.
    #[error("send queue full ({limit} messages)")]
    QueueFull {
        /// The configured bound.
        limit: usize,
    },

    /// A wire buffer ended before the announced structure.
    #[error("truncated packet: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes present.
        actual: usize,
    },

    /// A datagram failed structural validation.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// The peer speaks an incompatible protocol version.
    #[error("protocol version mismatch: peer {major}.{minor}")]
    VersionMismatch {
        /// Peer major version.
        major: u16,
        /// Peer minor version.
        minor: u16,
    },

    /// A message type id is not registered with the protocol map.
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),

    /// Codec failure while serializing or deserializing a message.
    #[error("codec error: {0}")]
    Codec(String),

    /// The peer refused authentication.
    #[error("authentication refused")]
    AuthenticationRefused,
}

impl Error {
    /// True when the error must tear the whole session down.
    ///
    /// Caller errors (unknown connection, bad family, stopped service) and
    /// transient conditions are not session fatal.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::TryReconnect
                | Self::VersionMismatch { .. }
                | Self::AuthenticationRefused
        )
    }

    /// True when the caller passed something wrong and no state changed.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NoConnection
                | Self::UnsupportedSocketFamily { .. }
                | Self::ServiceStopped
                | Self::QueueFull { .. }
                | Self::UnknownMessageType(_)
        )
    }
}

/// Final status delivered exactly once per submitted message, either here
/// or as a delivery on the peer -- never both, never neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The message was sent (and, for requests, the response arrived).
    Success,
    /// The message never made it onto the wire.
    NotSent,
    /// The message was sent but the session died before the response.
    SentNoResponse,
    /// The message was canceled locally.
    Canceled,
    /// The session was refused during authentication.
    AuthenticationFailure,
}

impl CompletionStatus {
    /// True for every status except [`CompletionStatus::Success`].
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_fatal_classification() {
        assert!(Error::TryReconnect.is_session_fatal());
        assert!(
            Error::VersionMismatch { major: 9, minor: 0 }.is_session_fatal()
        );
        assert!(!Error::NoConnection.is_session_fatal());
    }

    #[test]
    fn caller_error_classification() {
        assert!(Error::NoConnection.is_caller_error());
        assert!(Error::ServiceStopped.is_caller_error());
        assert!(!Error::TryReconnect.is_caller_error());
    }

    #[test]
    fn completion_status() {
        assert!(!CompletionStatus::Success.is_error());
        assert!(CompletionStatus::NotSent.is_error());
        assert!(CompletionStatus::SentNoResponse.is_error());
    }

    #[test]
    fn error_messages() {
        let err = Error::NoGateway { network_id: 3 };
        assert_eq!(err.to_string(), "no gateway configured for network 3");

        let err = Error::Truncated {
            expected: 8,
            actual: 3,
        };
        assert_eq!(err.to_string(), "truncated packet: expected 8 bytes, got 3");
    }
}
