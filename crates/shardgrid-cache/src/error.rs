//! Error types for the snapshot cache.

use thiserror::Error;

use shardgrid_meta::MetaError;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can escape a refresh or a write-back.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The metadata store failed at the transport level. The refresh aborts
    /// and live maps keep their prior values.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// The store rejected a write-back. In-memory state is left unchanged.
    #[error("write-back rejected for {key}")]
    WriteBack { key: String },
}
