//! Per-connection error type.

use crate::checksum::ChecksumError;
use crate::header::HeaderError;
use crate::store::{SessionId, StoreError};

/// Everything that can end a connection early.
///
/// None of these are fatal to the process; the server logs them at the
/// connection boundary and keeps accepting.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Malformed or out-of-range header; no state was created.
    #[error(transparent)]
    Header(#[from] HeaderError),

    /// The store refused the session (e.g. a retired identifier).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A socket write failed; the client is presumed gone.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// A socket write did not complete within the I/O deadline.
    #[error("write deadline exceeded")]
    Timeout,

    /// The final checksum could not be computed.
    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    /// The session was evicted while this connection was streaming it.
    #[error("session {0} expired while streaming")]
    EvictionRace(SessionId),
}

impl StreamError {
    /// Whether this error means the peer went away rather than misbehaved.
    pub fn is_client_gone(&self) -> bool {
        matches!(
            self,
            StreamError::Transport(_)
                | StreamError::Timeout
                | StreamError::Header(HeaderError::ConnectionClosed | HeaderError::Timeout)
        )
    }
}
