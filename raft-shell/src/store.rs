//! In-memory key-value storage for the Raft state machine.
//!
//! Commands from the Raft log are applied here. Every node owns one `KvStore`
//! and Raft guarantees they converge because they apply the same log.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Thread-safe key-value store used by each Raft node.
///
/// `BTreeMap` keeps iteration in key order, which is what `list` prints.
#[derive(Default)]
pub struct KvStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A poisoned lock only means another thread panicked mid-apply; the map
    /// itself is still a valid `BTreeMap`, so keep serving it.
    fn data(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn put(&self, key: String, value: String) {
        self.data().insert(key, value);
    }

    /// Removes a key. Returns whether the key was present.
    ///
    /// Removing an absent key is not an error.
    pub fn delete(&self, key: &str) -> bool {
        self.data().remove(key).is_some()
    }

    /// Returns the applied value for a key, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data().get(key).cloned()
    }

    /// Returns a copy of every key-value pair, in key order.
    ///
    /// Cloned so callers never hold the lock while iterating.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data().clone()
    }
}
