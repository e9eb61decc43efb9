//! Versioned records and their stat metadata.
//!
//! Every record fetched from the metadata store carries a [`Stat`]. For
//! non-bucketed records, stat equality under the same key implies the
//! payload is unchanged, which is what makes incremental reload safe.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};

/// Version metadata attached to a stored record.
///
/// Two stats compare equal iff all components are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Monotonic id assigned when the record was created.
    pub created_id: u64,
    /// Modification counter, bumped on every write.
    pub version: u64,
    /// Payload size in bytes.
    pub size: u64,
}

/// A raw record as returned by the store: JSON payload plus stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub payload: Vec<u8>,
    pub stat: Stat,
}

impl VersionedRecord {
    /// Decode the JSON payload into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> MetaResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| MetaError::Deserialize(e.to_string()))
    }
}

/// A decoded record paired with the stat it was fetched under.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub stat: Stat,
}

impl<T: DeserializeOwned> Versioned<T> {
    /// Decode a raw record, keeping its stat.
    pub fn decode(record: &VersionedRecord) -> MetaResult<Self> {
        Ok(Self {
            value: record.decode()?,
            stat: record.stat,
        })
    }
}

/// Serialize a typed record into a JSON payload for a store write.
pub fn encode<T: Serialize>(value: &T) -> MetaResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| MetaError::Serialize(e.to_string()))
}
