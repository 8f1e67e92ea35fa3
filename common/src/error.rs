//! Command-layer error type shared across crates.

use thiserror::Error;

/// Failure modes of a single control-plane command exchange.
///
/// The data plane (the byte forwarder) speaks plain [`std::io::Result`];
/// this type only covers the token protocol, where "the peer went away"
/// and "the peer went quiet" need to be told apart from transport errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The socket failed outright.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection before sending a command.
    #[error("peer closed the connection")]
    Closed,

    /// No command arrived within the command read timeout.
    #[error("timed out waiting for a command")]
    Timeout,
}

impl ProtocolError {
    /// True when the error means the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::Closed | ProtocolError::Timeout)
    }
}
