//! # Error Taxonomy
//!
//! Purpose: One error type for every layer of the client, from RESP framing
//! up to pool bookkeeping, so callers match on a single enum.
//!
//! ## Design Principles
//! 1. **Fatal vs. Recoverable**: `is_fatal` tells callers whether the
//!    connection that produced the error can still be used.
//! 2. **Server Errors Are Data**: a `-ERR` reply is only promoted to
//!    `RkvError::Server` where a command promises a non-error reply.
//! 3. **Shape Errors Name Both Sides**: reply mismatches carry the expected
//!    and actual `ValueKind`.

use std::io;

use thiserror::Error;

use crate::value::ValueKind;

/// Result alias used across the workspace.
pub type RkvResult<T> = Result<T, RkvError>;

/// Errors surfaced by the codec and the client.
#[derive(Debug, Error)]
pub enum RkvError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream at a frame boundary.
    #[error("connection closed by peer")]
    Closed,

    /// RESP framing violation; the connection is no longer in sync.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Well-formed `-` reply from the server.
    #[error("server error: {0}")]
    Server(String),

    /// Reply decoded fine but had the wrong shape for the call site.
    #[error("unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: ValueKind,
        actual: ValueKind,
    },

    /// API misuse such as a double connect or releasing a foreign connection.
    #[error("connection state error: {0}")]
    ConnectionState(String),

    /// AUTH handshake did not answer `+OK`.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A monitor feed line did not match the expected grammar.
    #[error("malformed monitor line at column {column}: {reason}")]
    MonitorParse { column: usize, reason: String },

    /// Invalid endpoint or pool configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RkvError {
    /// Builds a protocol error from anything printable.
    pub fn protocol(message: impl Into<String>) -> Self {
        RkvError::Protocol(message.into())
    }

    /// Returns true when the connection that raised this error must be
    /// closed rather than reused.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RkvError::Io(_) | RkvError::Closed | RkvError::Protocol(_)
        )
    }

    /// Returns true for read timeouts configured through the endpoint.
    pub fn is_timeout(&self) -> bool {
        match self {
            RkvError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RkvError::Closed.is_fatal());
        assert!(RkvError::protocol("bad prefix").is_fatal());
        assert!(RkvError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).is_fatal());
        assert!(!RkvError::Server("ERR nope".into()).is_fatal());
        assert!(!RkvError::ConnectionState("double connect".into()).is_fatal());
        assert!(!RkvError::MonitorParse {
            column: 3,
            reason: "x".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_timeout_detection() {
        let err = RkvError::Io(io::Error::new(io::ErrorKind::WouldBlock, "timeout"));
        assert!(err.is_timeout());
        assert!(!RkvError::Closed.is_timeout());
    }

    #[test]
    fn test_unexpected_reply_message() {
        let err = RkvError::UnexpectedReply {
            expected: ValueKind::Integer,
            actual: ValueKind::BulkString,
        };
        assert_eq!(
            err.to_string(),
            "unexpected reply: expected integer, got bulk string"
        );
    }
}
