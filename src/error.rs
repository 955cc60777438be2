//! Error types for ramstore.

use thiserror::Error;

use crate::types::ServerId;

/// Result type alias for ramstore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage and recovery operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Peer is no longer in the server list.
    #[error("server {0} is not up")]
    ServerNotUp(ServerId),

    /// RPC transport failed before a reply arrived.
    #[error("transport failure talking to {server}: {message}")]
    Transport { server: ServerId, message: String },

    /// No log digest was found among the replicas on available backups.
    #[error("no log digest found for crashed server {0}")]
    DigestMissing(ServerId),

    /// The log digest names segments with no replica on any backup.
    #[error("log incomplete: {missing} segment(s) in the digest have no replica")]
    LogIncomplete {
        /// Number of digest segments with no available replica.
        missing: usize,
    },

    /// Segment metadata failed its integrity check.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A client-supplied enumeration iterator could not be decoded.
    #[error("malformed enumeration iterator: {0}")]
    BadIterator(String),

    /// A wire buffer was shorter than its framing claims.
    #[error("truncated input: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create a transport error for the given server.
    pub fn transport<S: Into<String>>(server: ServerId, msg: S) -> Self {
        Error::Transport {
            server,
            message: msg.into(),
        }
    }

    /// Create a bad-iterator error.
    pub fn bad_iterator<S: Into<String>>(msg: S) -> Self {
        Error::BadIterator(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if this error means a recovery attempt should be retried
    /// later rather than treated as permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DigestMissing(_) | Error::LogIncomplete { .. })
    }

    /// Check if this error indicates an unreachable or departed peer.
    pub fn is_server_gone(&self) -> bool {
        matches!(self, Error::ServerNotUp(_) | Error::Transport { .. })
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::Truncated { .. })
    }
}
