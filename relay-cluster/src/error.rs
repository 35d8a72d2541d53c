//! Error types for cluster module

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Connection already registered: {0}")]
    DuplicateConnection(String),
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
