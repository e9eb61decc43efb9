//! Metadata-store contract and the in-memory store used by tests.
//!
//! [`MetaStore`] is the read/write surface the snapshot cache consumes. The
//! real implementation wraps the coordination-service client and lives
//! outside this repo; [`InMemoryMetaStore`] provides the same semantics over
//! a `Mutex<HashMap>` tree, plus per-category read counters so tests can
//! assert that incremental reload skipped unchanged records.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{MetaError, MetaResult};
use crate::key::PropertyKey;
use crate::record::{Stat, Versioned, VersionedRecord, encode};

/// Read/write contract against the hierarchical metadata store.
///
/// Batch operations return results positionally aligned with the input key
/// slice; a missing entry is `None`, never an error. Errors are reserved for
/// transport-level failures.
pub trait MetaStore: Send + Sync {
    /// List the child names under a parent key.
    fn children(&self, parent: &PropertyKey) -> MetaResult<Vec<String>>;

    /// Fetch a single record, or `None` if the key does not exist.
    fn get(&self, key: &PropertyKey) -> MetaResult<Option<VersionedRecord>>;

    /// Batch-fetch records, positionally aligned with `keys`.
    fn get_batch(&self, keys: &[PropertyKey]) -> MetaResult<Vec<Option<VersionedRecord>>>;

    /// Batch-fetch version metadata only, positionally aligned with `keys`.
    fn stats(&self, keys: &[PropertyKey]) -> MetaResult<Vec<Option<Stat>>>;

    /// Write a record. Returns `false` if the store rejected the write.
    fn set(&self, key: &PropertyKey, payload: &[u8]) -> MetaResult<bool>;
}

/// Fetch and decode every child under a parent key.
///
/// Children that vanish between the listing and the fetch, and children
/// whose payload fails to decode, are logged and dropped; they will be
/// retried on the next refresh.
pub fn child_values_map<S, T>(store: &S, parent: &PropertyKey) -> MetaResult<HashMap<String, T>>
where
    S: MetaStore + ?Sized,
    T: DeserializeOwned,
{
    let names = store.children(parent)?;
    let mut entries: Vec<(String, PropertyKey)> = Vec::with_capacity(names.len());
    for name in names {
        if let Some(key) = parent.child(&name) {
            entries.push((name, key));
        }
    }

    let keys: Vec<PropertyKey> = entries.iter().map(|(_, k)| k.clone()).collect();
    let records = store.get_batch(&keys)?;

    let mut out = HashMap::with_capacity(entries.len());
    for ((name, key), record) in entries.into_iter().zip(records) {
        match record {
            Some(raw) => match raw.decode::<T>() {
                Ok(value) => {
                    out.insert(name, value);
                }
                Err(error) => warn!(%key, %error, "dropping undecodable record"),
            },
            None => warn!(%key, "listed child disappeared before fetch"),
        }
    }
    Ok(out)
}

/// Fetch and decode a single record.
pub fn get_typed<S, T>(store: &S, key: &PropertyKey) -> MetaResult<Option<T>>
where
    S: MetaStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key)? {
        Some(raw) => Ok(Some(raw.decode()?)),
        None => Ok(None),
    }
}

/// Fetch and decode a single record, keeping its stat.
pub fn get_versioned<S, T>(store: &S, key: &PropertyKey) -> MetaResult<Option<Versioned<T>>>
where
    S: MetaStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key)? {
        Some(raw) => Ok(Some(Versioned::decode(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write a single record.
pub fn set_typed<S, T>(store: &S, key: &PropertyKey, value: &T) -> MetaResult<bool>
where
    S: MetaStore + ?Sized,
    T: Serialize,
{
    let payload = encode(value)?;
    store.set(key, &payload)
}

struct StoredNode {
    payload: Vec<u8>,
    stat: Stat,
}

/// In-memory metadata store for tests and local development.
///
/// Mirrors the contract of the real store over a path-keyed map. Every read
/// is counted per key category, so tests can assert how many full-record
/// fetches, stat fetches, or child listings an operation performed.
#[derive(Default)]
pub struct InMemoryMetaStore {
    tree: Mutex<HashMap<String, StoredNode>>,
    next_created_id: AtomicU64,
    counters: Mutex<HashMap<String, usize>>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize and store a record under the given key.
    pub fn put<T: Serialize>(&self, key: &PropertyKey, value: &T) -> MetaResult<()> {
        let payload = encode(value)?;
        self.set(key, &payload)?;
        Ok(())
    }

    /// Delete a record. Returns `true` if it existed.
    pub fn remove(&self, key: &PropertyKey) -> bool {
        let mut tree = self.tree.lock().expect("tree lock");
        tree.remove(&key.path()).is_some()
    }

    /// Number of full-record reads performed against a category since the
    /// last [`Self::reset_counters`].
    pub fn full_reads(&self, category: &str) -> usize {
        self.counter(&format!("get:{category}"))
    }

    /// Number of stat-only reads performed against a category.
    pub fn stat_reads(&self, category: &str) -> usize {
        self.counter(&format!("stat:{category}"))
    }

    /// Number of child listings performed against a category.
    pub fn child_lists(&self, category: &str) -> usize {
        self.counter(&format!("children:{category}"))
    }

    /// Number of writes performed against a category.
    pub fn writes(&self, category: &str) -> usize {
        self.counter(&format!("set:{category}"))
    }

    pub fn reset_counters(&self) {
        self.counters.lock().expect("counters lock").clear();
    }

    fn counter(&self, name: &str) -> usize {
        *self
            .counters
            .lock()
            .expect("counters lock")
            .get(name)
            .unwrap_or(&0)
    }

    fn bump(&self, op: &str, category: &str) {
        let mut counters = self.counters.lock().expect("counters lock");
        *counters.entry(format!("{op}:{category}")).or_insert(0) += 1;
    }
}

impl MetaStore for InMemoryMetaStore {
    fn children(&self, parent: &PropertyKey) -> MetaResult<Vec<String>> {
        if !parent.is_parent() {
            return Err(MetaError::NotAParent(parent.path()));
        }
        self.bump("children", parent.category());

        let prefix = format!("{}/", parent.path());
        let tree = self.tree.lock().expect("tree lock");
        let mut names: Vec<String> = tree
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn get(&self, key: &PropertyKey) -> MetaResult<Option<VersionedRecord>> {
        self.bump("get", key.category());
        let tree = self.tree.lock().expect("tree lock");
        Ok(tree.get(&key.path()).map(|node| VersionedRecord {
            payload: node.payload.clone(),
            stat: node.stat,
        }))
    }

    fn get_batch(&self, keys: &[PropertyKey]) -> MetaResult<Vec<Option<VersionedRecord>>> {
        let tree = self.tree.lock().expect("tree lock");
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            self.bump("get", key.category());
            out.push(tree.get(&key.path()).map(|node| VersionedRecord {
                payload: node.payload.clone(),
                stat: node.stat,
            }));
        }
        Ok(out)
    }

    fn stats(&self, keys: &[PropertyKey]) -> MetaResult<Vec<Option<Stat>>> {
        let tree = self.tree.lock().expect("tree lock");
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            self.bump("stat", key.category());
            out.push(tree.get(&key.path()).map(|node| node.stat));
        }
        Ok(out)
    }

    fn set(&self, key: &PropertyKey, payload: &[u8]) -> MetaResult<bool> {
        self.bump("set", key.category());
        let mut tree = self.tree.lock().expect("tree lock");
        match tree.get_mut(&key.path()) {
            Some(node) => {
                node.payload = payload.to_vec();
                node.stat.version += 1;
                node.stat.size = payload.len() as u64;
            }
            None => {
                let created_id = self.next_created_id.fetch_add(1, Ordering::Relaxed);
                tree.insert(
                    key.path(),
                    StoredNode {
                        payload: payload.to_vec(),
                        stat: Stat {
                            created_id,
                            version: 1,
                            size: payload.len() as u64,
                        },
                    },
                );
            }
        }
        Ok(true)
    }
}
