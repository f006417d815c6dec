//! LRU cache implementation
//!
//! Entries live in a slot arena. The key map and the recency list both refer to the same
//! slot index, so each key has exactly one owned entry.
//!
//! Every write or removal bumps a version counter in the key's stripe. Callers that read
//! the backing store outside the cache lock take a [`Version`] first and hand it to
//! [`LruCache::fill`] or [`LruCache::put_if_unchanged`], which refuse to install a value
//! that a concurrent write or removal has already superseded.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use xxhash_rust::xxh3::xxh3_64;

const VERSION_STRIPES: usize = 64;

/// Approximate in-memory footprint of a cached value, in bytes.
///
/// Must be deterministic for a given value so that accounting stays exact.
pub trait Weigh {
    fn weight(&self) -> usize;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("item of {size} bytes does not fit in a cache of {capacity} bytes")]
    Full { size: usize, capacity: usize },
}

struct Entry<V> {
    key: String,
    value: V,
    size: usize,
    last_access: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<V> {
    map: HashMap<String, usize>,
    slots: Vec<Option<Entry<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    used: usize,
    versions: [u64; VERSION_STRIPES],
}

/// Snapshot of a key's write version, taken before reading the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    stripe: usize,
    counter: u64,
}

/// Thread-safe LRU cache bounded by total entry size rather than entry count.
pub struct LruCache<V> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone + Weigh> LruCache<V> {
    /// Create a new cache holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
                used: 0,
                versions: [0; VERSION_STRIPES],
            }),
        }
    }

    pub fn version(&self, key: &str) -> Version {
        let stripe = stripe_of(key);
        Version {
            stripe,
            counter: self.inner.lock().versions[stripe],
        }
    }

    /// Returns a copy of the value and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let index = *inner.map.get(key)?;

        inner.move_to_front(index);
        let entry = inner.slots[index].as_mut()?;
        entry.last_access = Instant::now();
        Some(entry.value.clone())
    }

    /// Inserts or replaces a value, evicting least recently used entries to make room.
    ///
    /// A value larger than the whole cache is rejected with [`CacheError::Full`]; any
    /// previous entry under the same key is dropped so it cannot be served stale.
    pub fn put(&self, key: &str, value: V) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        self.insert(&mut inner, key, value)
    }

    /// Like [`LruCache::put`], unless the key was written or removed since `version` was
    /// taken. In that case the entry is invalidated instead and `Ok(false)` is returned.
    pub fn put_if_unchanged(&self, key: &str, value: V, version: Version) -> Result<bool, CacheError> {
        let mut inner = self.inner.lock();
        if inner.versions[version.stripe] != version.counter {
            inner.invalidate(key);
            return Ok(false);
        }
        self.insert(&mut inner, key, value).map(|_| true)
    }

    /// Installs a value read from the backing store. Nothing happens if the key is
    /// already resident or was written or removed since `version` was taken.
    pub fn fill(&self, key: &str, value: V, version: Version) -> Result<bool, CacheError> {
        let mut inner = self.inner.lock();
        if inner.versions[version.stripe] != version.counter || inner.map.contains_key(key) {
            return Ok(false);
        }
        self.insert(&mut inner, key, value).map(|_| true)
    }

    /// Applies `update` to the resident value under the cache lock.
    ///
    /// `update` returns whether the entry counts as a hit; it must leave the value alone
    /// when it returns `false`. On a hit the entry is re-weighed, marked most recently used
    /// and a copy of the updated value is returned. An absent key is never recreated.
    pub fn update_if_present<F>(&self, key: &str, update: F) -> Option<V>
    where
        F: FnOnce(&mut V) -> bool,
    {
        let mut inner = self.inner.lock();
        let index = *inner.map.get(key)?;
        let entry = inner.slots[index].as_mut()?;
        if !update(&mut entry.value) {
            return None;
        }

        let old_size = entry.size;
        let size = key.len() + entry.value.weight();
        entry.size = size;
        entry.last_access = Instant::now();
        let value = entry.value.clone();
        inner.used = inner.used - old_size + size;

        if size > self.capacity {
            inner.remove_slot(index);
            return Some(value);
        }

        inner.move_to_front(index);
        while inner.used > self.capacity {
            if !inner.evict_lru(index) {
                break;
            }
        }
        Some(value)
    }

    /// Removes the entry if present. Always counts as a write to the key.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.lock().invalidate(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for version in inner.versions.iter_mut() {
            *version = version.wrapping_add(1);
        }
        inner.map.clear();
        inner.slots.clear();
        inner.free.clear();
        inner.head = None;
        inner.tail = None;
        inner.used = 0;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    /// Bytes currently accounted to resident entries.
    pub fn size(&self) -> usize {
        self.inner.lock().used
    }

    pub fn count(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Last time the entry was read or written. Does not affect recency.
    pub fn last_access(&self, key: &str) -> Option<Instant> {
        let inner = self.inner.lock();
        let index = *inner.map.get(key)?;
        inner.slots[index].as_ref().map(|entry| entry.last_access)
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys = Vec::with_capacity(inner.map.len());
        let mut cursor = inner.head;

        while let Some(index) = cursor {
            match inner.slots[index].as_ref() {
                Some(entry) => {
                    keys.push(entry.key.clone());
                    cursor = entry.next;
                }
                None => break,
            }
        }
        keys
    }

    fn insert(&self, inner: &mut Inner<V>, key: &str, value: V) -> Result<(), CacheError> {
        let size = key.len() + value.weight();
        inner.bump(key);

        if size > self.capacity {
            if let Some(index) = inner.map.get(key).copied() {
                inner.remove_slot(index);
            }
            return Err(CacheError::Full {
                size,
                capacity: self.capacity,
            });
        }

        let now = Instant::now();
        let existing = inner.map.get(key).copied();
        let index = match existing {
            Some(index) => {
                let mut old_size = 0;
                if let Some(entry) = inner.slots[index].as_mut() {
                    old_size = entry.size;
                    entry.value = value;
                    entry.size = size;
                    entry.last_access = now;
                }
                inner.used = inner.used - old_size + size;
                inner.move_to_front(index);
                index
            }
            None => {
                let index = inner.allocate(Entry {
                    key: key.to_string(),
                    value,
                    size,
                    last_access: now,
                    prev: None,
                    next: None,
                });
                inner.map.insert(key.to_string(), index);
                inner.push_front(index);
                inner.used += size;
                index
            }
        };

        while inner.used > self.capacity {
            if !inner.evict_lru(index) {
                break;
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn entry_sizes(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().flatten().map(|entry| entry.size).sum()
    }
}

fn stripe_of(key: &str) -> usize {
    (xxh3_64(key.as_bytes()) % VERSION_STRIPES as u64) as usize
}

impl<V> Inner<V> {
    fn bump(&mut self, key: &str) {
        let stripe = stripe_of(key);
        self.versions[stripe] = self.versions[stripe].wrapping_add(1);
    }

    fn invalidate(&mut self, key: &str) -> Option<V> {
        self.bump(key);
        let index = self.map.get(key).copied()?;
        self.remove_slot(index).map(|entry| entry.value)
    }

    fn allocate(&mut self, entry: Entry<V>) -> usize {
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(entry);
            index
        } else {
            self.slots.push(Some(entry));
            self.slots.len() - 1
        }
    }

    fn push_front(&mut self, index: usize) {
        let old_head = self.head;
        if let Some(entry) = self.slots[index].as_mut() {
            entry.prev = None;
            entry.next = old_head;
        }

        if let Some(old_head) = old_head
            && let Some(entry) = self.slots[old_head].as_mut()
        {
            entry.prev = Some(index);
        }

        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match self.slots[index].as_ref() {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };

        match prev {
            Some(prev_index) => {
                if let Some(entry) = self.slots[prev_index].as_mut() {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }

        match next {
            Some(next_index) => {
                if let Some(entry) = self.slots[next_index].as_mut() {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        self.push_front(index);
    }

    fn remove_slot(&mut self, index: usize) -> Option<Entry<V>> {
        self.unlink(index);
        let entry = self.slots[index].take()?;
        self.map.remove(&entry.key);
        self.free.push(index);
        self.used -= entry.size;
        Some(entry)
    }

    /// Evicts the tail entry unless it is `protected`. Returns whether anything was evicted.
    fn evict_lru(&mut self, protected: usize) -> bool {
        match self.tail {
            Some(tail) if tail != protected => {
                if let Some(entry) = self.remove_slot(tail) {
                    tracing::debug!("Evicted {} ({} bytes) from cache", entry.key, entry.size);
                }
                true
            }
            _ => false,
        }
    }
}
