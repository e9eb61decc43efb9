//! Error types for metadata-store operations.

use thiserror::Error;

/// Result type alias for metadata-store operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Errors that can occur while talking to the metadata store.
#[derive(Debug, Error)]
pub enum MetaError {
    /// The store could not be reached or the request failed in transit.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// A write was rejected by the store.
    #[error("write rejected for {0}")]
    Write(String),

    /// A key that cannot have children was used as a listing parent.
    #[error("not a parent key: {0}")]
    NotAParent(String),
}
