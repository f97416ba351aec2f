//! Error types for the certgate operator

use thiserror::Error;

/// Main error type for certgate operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Another worker holds the lock for the same resource
    #[error("contention: {0}")]
    Contention(String),

    /// A referenced resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed resource contents (certificate bytes, secret data, specs)
    #[error("data error: {0}")]
    Data(String),

    /// Watch stream failure
    #[error("watch error: {0}")]
    Watch(String),

    /// Invalid process configuration
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a contention error with the given message
    pub fn contention(msg: impl Into<String>) -> Self {
        Self::Contention(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a data error with the given message
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a watch error with the given message
    pub fn watch(msg: impl Into<String>) -> Self {
        Self::Watch(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error means another worker already holds the resource
    ///
    /// Contention is an expected outcome under concurrent audits, callers
    /// typically skip the resource rather than fail the whole pass.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention(_))
    }

    /// Whether this error means the referenced resource is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
