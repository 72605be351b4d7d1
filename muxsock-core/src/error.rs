/// Muxsock Error Types
///
/// Error taxonomy for all core operations.

use std::io;
use thiserror::Error;

/// Main error type for muxsock operations
#[derive(Debug, Error)]
pub enum Error {
    /// Allocation failure or a handle table at capacity
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Stale or out-of-range handle
    #[error("invalid handle: {0}")]
    InvalidHandle(usize),

    /// Listen or connect failure on the given address
    #[error("address error: {0}")]
    Address(#[source] io::Error),

    /// Operation on a zombie connection
    #[error("connection is dead")]
    InvalidState,

    /// Non-blocking operation with no progress possible
    #[error("operation would block")]
    WouldBlock,

    /// Blocking receive exceeded its wait bound
    #[error("timed out waiting for an event")]
    Timeout,

    /// Malformed frame stream
    #[error("wire error: {0}")]
    Wire(#[from] muxsock_wire::WireError),

    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for muxsock operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True if retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::Timeout)
    }
}
