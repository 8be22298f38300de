//! Error types for attrstore
//!
//! Every store operation reports failures through [`Error`]. Validation and
//! existence failures are raised before anything is proposed to the
//! replicated log; replication failures abort before the local index is
//! touched.

use thiserror::Error;

/// Common result type for attrstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for attrstore
#[derive(Debug, Error)]
pub enum Error {
    // Request validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    // Replication
    #[error("replication failed: {0}")]
    Replication(String),

    #[error("not leader")]
    NotLeader,

    // Encoding and internal failures
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a key not found error
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound(key.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotLeader | Self::Replication(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_))
    }

    /// Whether the submission to the replicated log failed
    #[must_use]
    pub fn is_replication_failure(&self) -> bool {
        matches!(
            self,
            Self::NotLeader | Self::Replication(_) | Self::Serialization(_)
        )
    }
}
