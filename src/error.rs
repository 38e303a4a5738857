//! # Cache Error Types
//!
//! Structured error handling for the cache layer using thiserror.
//!
//! Only programmer-error conditions and hard backend faults surface as
//! errors. Expected runtime conditions (a miss, a CAS conflict, an expired
//! entry, a lock timeout) are ordinary return values such as `Ok(false)`,
//! [`LookupState::Miss`](crate::store::LookupState) or `Ok(None)` and never
//! show up here.

use thiserror::Error;

/// Cache error taxonomy
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key violates backend constraints (length, charset). A programming
    /// error, not a transient condition.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Collection name is malformed for the target backend.
    #[error("invalid collection name {name:?}: {reason}")]
    InvalidCollection { name: String, reason: String },

    /// commit()/rollback() called without a matching begin().
    #[error("attempted to {operation} without having begun a transaction")]
    UnbegunTransaction { operation: String },

    /// A transaction was torn down while writes were still pending.
    #[error("transaction destroyed without having been committed or rolled back")]
    UncommittedTransaction,

    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Backend connection/protocol failure.
    #[error("backend unavailable: {message}")]
    Backend { message: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Create an invalid-key error
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-collection error
    pub fn invalid_collection(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCollection {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an unbegun-transaction error
    pub fn unbegun(operation: impl Into<String>) -> Self {
        Self::UnbegunTransaction {
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a backend-unavailable error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
