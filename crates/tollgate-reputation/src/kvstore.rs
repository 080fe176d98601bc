//! Durable keyed-record store used by reputation, replication, and jobs.
//!
//! The in-memory implementation is a BTreeMap behind a lock. Production
//! deployments swap in any store that honors atomic `write_batch`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait for durable tollgate state.
///
/// Every background job talks to the others only through this store, so any
/// one of them can restart without coordination.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<()>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>>;

    /// Scan a range of keys [start, end), returning (key, value) pairs in sorted order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;
}

/// A single operation in a write batch.
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

impl BatchOp {
    /// Build a put of a bincode-encoded record.
    pub fn put_record<T: Serialize>(key: Vec<u8>, record: &T) -> Result<Self> {
        Ok(BatchOp::Put {
            key,
            value: bincode::serialize(record)?,
        })
    }
}

/// Decode a bincode record read from the store.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Read and decode a single record.
pub fn get_record<T: DeserializeOwned>(store: &dyn KvStore, key: &[u8]) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a single record.
pub fn put_record<T: Serialize>(store: &dyn KvStore, key: Vec<u8>, record: &T) -> Result<()> {
    store.put(key, bincode::serialize(record)?)
}

/// Decode every record under a prefix.
pub fn scan_records<T: DeserializeOwned>(store: &dyn KvStore, prefix: &[u8]) -> Result<Vec<T>> {
    store
        .scan_prefix(prefix)?
        .into_iter()
        .map(|(_, v)| decode(&v))
        .collect()
}

/// In-memory KV store backed by a BTreeMap.
///
/// Does not persist across restarts.
#[derive(Clone)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.data.write().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read();
        let mut result = Vec::new();
        for (k, v) in data.range::<Vec<u8>, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read();
        let result: Vec<_> = data
            .range::<Vec<u8>, _>((
                Bound::Included(start.to_vec()),
                Bound::Excluded(end.to_vec()),
            ))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(result)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = MemoryKvStore::new();
        store.put(b"key1".to_vec(), b"value1".to_vec()).unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key2").unwrap(), None);
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let store = MemoryKvStore::new();
        store.delete(b"nope").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let store = MemoryKvStore::new();
        store.put(b"rep/a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"rep/b".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"repl/x".to_vec(), b"3".to_vec()).unwrap();

        let result = store.scan_prefix(b"rep/").unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, b"rep/a");
        assert_eq!(result[1].0, b"rep/b");
    }

    #[test]
    fn test_scan_range_is_half_open() {
        let store = MemoryKvStore::new();
        for k in [b"a", b"b", b"c"] {
            store.put(k.to_vec(), b"v".to_vec()).unwrap();
        }
        let result = store.scan_range(b"a", b"c").unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_write_batch_applies_all_ops() {
        let store = MemoryKvStore::new();
        store.put(b"gone".to_vec(), b"x".to_vec()).unwrap();
        store
            .write_batch(vec![
                BatchOp::Put {
                    key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                },
                BatchOp::Delete {
                    key: b"gone".to_vec(),
                },
            ])
            .unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_record_helpers_round_trip() {
        let store = MemoryKvStore::new();
        put_record(&store, b"n".to_vec(), &(7u64, "seven".to_string())).unwrap();
        let got: Option<(u64, String)> = get_record(&store, b"n").unwrap();
        assert_eq!(got, Some((7, "seven".to_string())));
        let missing: Option<u64> = get_record(&store, b"m").unwrap();
        assert!(missing.is_none());
    }
}
