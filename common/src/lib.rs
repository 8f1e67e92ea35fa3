//! Shared pieces of the rtun reverse tunnel.
//!
//! Control plane: fixed ASCII command tokens, one blocking read per command.
//! Data plane:   HTTP/1.x-framing-aware byte forwarding, so a data
//!               connection can be pooled again after one request/response
//!               cycle instead of being torn down.

pub mod detector;
pub mod error;
pub mod exchange;
pub mod protocol;

pub use error::ProtocolError;
