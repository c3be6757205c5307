//! In-memory holders for loaded values.
//!
//! [`StorageContainer`] holds a single value behind an atomically swapped
//! `Arc`. [`MaterializedMap`] is the process-local copy of a value table that
//! the replicated cache reads from and mutates.

use crate::error::Result;
use crate::handler::StorageHandler;
use crate::types::MessageId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// The last known value loaded from a handler.
///
/// Construction performs exactly one `load_or_else`; if that fails the
/// container is never created.
pub struct StorageContainer<T> {
    value: RwLock<Arc<T>>,
}

impl<T> StorageContainer<T> {
    /// Load the value from `handler`, falling back to `default`.
    pub fn open<H, F>(handler: &H, default: F) -> Result<Self>
    where
        H: StorageHandler<T>,
        F: FnOnce() -> T,
    {
        let value = handler.load_or_else(default)?;
        Ok(Self::new(value))
    }

    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(Arc::new(value)),
        }
    }

    /// Current value. Never performs I/O.
    ///
    /// Takes a short read lock, so it can wait briefly while a concurrent
    /// [`replace`](Self::replace) swaps the `Arc`.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.value.read())
    }

    /// Swap in a new value, returning the previous one.
    pub fn replace(&self, value: T) -> Arc<T> {
        std::mem::replace(&mut *self.value.write(), Arc::new(value))
    }
}

struct Entries<K, V> {
    values: HashMap<K, V>,
    /// Id of the replication message whose effect is materialized, per key.
    versions: HashMap<K, MessageId>,
    /// Every message at or below this id is already reflected in `values`.
    floor: MessageId,
}

/// Thread-safe, process-local copy of a value table.
pub struct MaterializedMap<K, V> {
    inner: RwLock<Entries<K, V>>,
}

impl<K, V> MaterializedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::from_map(HashMap::new())
    }

    pub fn from_map(values: HashMap<K, V>) -> Self {
        Self {
            inner: RwLock::new(Entries {
                values,
                versions: HashMap::new(),
                floor: MessageId(0),
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().values.get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.read().values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().values.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.read().values.keys().cloned().collect()
    }

    /// Copy of every entry at this instant.
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.inner.read().values.clone()
    }

    /// Upsert (`Some`) or remove (`None`) unconditionally.
    ///
    /// Returns the previous value.
    pub fn apply(&self, key: K, value: Option<V>) -> Option<V> {
        let mut inner = self.inner.write();
        match value {
            Some(v) => inner.values.insert(key, v),
            None => inner.values.remove(&key),
        }
    }

    /// Apply a mutation carried by replication message `id`.
    ///
    /// Ignored if the key already reflects a message with an id >= `id`, or
    /// if `id` is at or below the reseed watermark.
    /// Returns whether the mutation was applied.
    pub fn apply_versioned(&self, key: K, value: Option<V>, id: MessageId) -> bool {
        let mut inner = self.inner.write();
        if id <= inner.floor {
            return false;
        }
        if let Some(current) = inner.versions.get(&key) {
            if *current >= id {
                return false;
            }
        }

        inner.versions.insert(key.clone(), id);
        match value {
            Some(v) => {
                inner.values.insert(key, v);
            }
            None => {
                inner.values.remove(&key);
            }
        }
        true
    }

    /// Replace the contents with `values`, a table snapshot that reflects every
    /// message up to `watermark`.
    ///
    /// Keys already carrying a version newer than `watermark` keep their
    /// current state. Later deliveries at or below `watermark` are ignored.
    pub fn reseed(&self, values: HashMap<K, V>, watermark: MessageId) {
        let mut inner = self.inner.write();
        let inner = &mut *inner;

        let mut next = values;
        for (key, version) in &inner.versions {
            if *version > watermark {
                match inner.values.get(key) {
                    Some(v) => {
                        next.insert(key.clone(), v.clone());
                    }
                    None => {
                        next.remove(key);
                    }
                }
            }
        }

        inner.values = next;
        inner.versions.retain(|_, version| *version > watermark);
        if watermark > inner.floor {
            inner.floor = watermark;
        }
    }

    /// Id of the message last applied to `key`, if any.
    pub fn version(&self, key: &K) -> Option<MessageId> {
        self.inner.read().versions.get(key).copied()
    }
}

impl<K, V> Default for MaterializedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
