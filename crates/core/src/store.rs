//! Versioned record storage.
//!
//! The engine's persistence contract is narrow: durable single-document
//! read-modify-write with an explicit version per record. `RecordStore`
//! provides that contract in memory. Every record carries a monotonically
//! increasing version; writers either `compare_and_swap` against the version
//! they read (optimistic concurrency, used for case advances) or `mutate`
//! under the record's own lock (linearizable per key, used for resource
//! capacity updates). Two different keys never contend on the same lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};

/// A record together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Storage-level failures, mapped to domain errors by each component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    Missing,
    #[error("record version conflict")]
    VersionConflict,
    #[error("record already exists")]
    Duplicate,
}

/// In-memory versioned document store.
///
/// The outer map is only locked to look up or insert an entry; all value
/// access goes through the entry's own mutex, so operations on different
/// keys proceed concurrently.
#[derive(Debug)]
pub struct RecordStore<K, V> {
    entries: RwLock<HashMap<K, Arc<Mutex<Versioned<V>>>>>,
}

impl<K, V> RecordStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &K) -> Option<Arc<Mutex<Versioned<V>>>> {
        let map = self.entries.read().expect("record store lock poisoned");
        map.get(key).cloned()
    }

    /// Inserts a new record at version 0.
    pub fn insert(&self, key: K, value: V) -> Result<(), StoreError> {
        let mut map = self.entries.write().expect("record store lock poisoned");
        if map.contains_key(&key) {
            return Err(StoreError::Duplicate);
        }
        map.insert(key, Arc::new(Mutex::new(Versioned { value, version: 0 })));
        Ok(())
    }

    /// Reads a record together with its current version.
    pub fn get(&self, key: &K) -> Option<Versioned<V>> {
        let entry = self.entry(key)?;
        let guard = entry.lock().expect("record lock poisoned");
        Some(guard.clone())
    }

    /// Replaces the record if and only if its version still equals
    /// `expected`. Returns the new version on success.
    pub fn compare_and_swap(&self, key: &K, expected: u64, value: V) -> Result<u64, StoreError> {
        let entry = self.entry(key).ok_or(StoreError::Missing)?;
        let mut guard = entry.lock().expect("record lock poisoned");
        if guard.version != expected {
            return Err(StoreError::VersionConflict);
        }
        guard.value = value;
        guard.version += 1;
        Ok(guard.version)
    }

    /// Applies `f` to the record under its lock and bumps the version.
    ///
    /// This is the linearizable path: capacity checks and the mutation they
    /// guard execute under the same per-key critical section. `f` must not
    /// perform I/O or block.
    pub fn mutate<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Result<R, StoreError> {
        let entry = self.entry(key).ok_or(StoreError::Missing)?;
        let mut guard = entry.lock().expect("record lock poisoned");
        let result = f(&mut guard.value);
        guard.version += 1;
        Ok(result)
    }

    /// Snapshot of all records. Keys are collected under the map read lock;
    /// each value is then cloned under its own lock, so the snapshot is
    /// per-record consistent, not globally consistent.
    pub fn snapshot(&self) -> Vec<(K, Versioned<V>)> {
        let entries: Vec<(K, Arc<Mutex<Versioned<V>>>)> = {
            let map = self.entries.read().expect("record store lock poisoned");
            map.iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };
        entries
            .into_iter()
            .map(|(k, entry)| {
                let guard = entry.lock().expect("record lock poisoned");
                (k, guard.clone())
            })
            .collect()
    }

    /// Whether a record exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        let map = self.entries.read().expect("record store lock poisoned");
        map.contains_key(key)
    }
}

impl<K, V> Default for RecordStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn insert_rejects_duplicates() {
        let store: RecordStore<&str, u32> = RecordStore::new();
        store.insert("a", 1).expect("first insert");
        assert_eq!(store.insert("a", 2), Err(StoreError::Duplicate));
    }

    #[test]
    fn compare_and_swap_detects_stale_version() {
        let store: RecordStore<&str, u32> = RecordStore::new();
        store.insert("a", 1).expect("insert");

        let read = store.get(&"a").expect("record exists");
        assert_eq!(read.version, 0);

        // A writer who read version 0 wins...
        let v1 = store.compare_and_swap(&"a", 0, 2).expect("first writer");
        assert_eq!(v1, 1);

        // ...and a second writer with the same stale view loses.
        assert_eq!(
            store.compare_and_swap(&"a", 0, 3),
            Err(StoreError::VersionConflict)
        );
        assert_eq!(store.get(&"a").expect("record exists").value, 2);
    }

    #[test]
    fn mutate_bumps_version() {
        let store: RecordStore<&str, Vec<u32>> = RecordStore::new();
        store.insert("a", vec![]).expect("insert");
        store.mutate(&"a", |v| v.push(7)).expect("mutate");
        let read = store.get(&"a").expect("record exists");
        assert_eq!(read.value, vec![7]);
        assert_eq!(read.version, 1);
    }

    #[test]
    fn mutate_missing_key_is_an_error() {
        let store: RecordStore<&str, u32> = RecordStore::new();
        assert_eq!(store.mutate(&"nope", |_| ()), Err(StoreError::Missing));
    }

    #[test]
    fn concurrent_mutations_on_one_key_are_serialized() {
        let store: Arc<RecordStore<&str, u64>> = Arc::new(RecordStore::new());
        store.insert("counter", 0).expect("insert");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..100 {
                        store.mutate(&"counter", |v| *v += 1).expect("mutate");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        let read = store.get(&"counter").expect("record exists");
        assert_eq!(read.value, 800);
        assert_eq!(read.version, 800);
    }
}
