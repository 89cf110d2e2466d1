//! In-memory cache of decrypted keys, keyed by [`CacheKey`].
//!
//! The store stays the source of truth: entries are dropped on every
//! mutation of the keys they describe and may be dropped at any other time.
//! The cache uses `arc-swap` for lock-free reads on the hot path.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use common::{KeyMetadata, KeyType};

use crate::entropy::SecretKey;

/// Cache slot selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A specific record.
    ById(String),
    /// Whichever record is currently Active for the type.
    ActiveOfType(KeyType),
}

/// A decrypted key together with the metadata it was read with.
#[derive(Debug, Clone)]
pub struct CachedKey {
    pub secret: SecretKey,
    pub metadata: KeyMetadata,
}

/// Process-local cache of decrypted keys.
///
/// Readers never block; writers copy the map and swap it in with
/// [`ArcSwap::rcu`], so concurrent writers never lose each other's updates.
///
/// Every invalidation bumps a generation counter stored in the same
/// snapshot as the entries. A read-through fill captures the generation
/// before it reads the store and calls [`KeyCache::put_if_unchanged`], which
/// refuses the write if any invalidation happened in between.
#[derive(Clone, Debug)]
pub struct KeyCache {
    inner: Arc<ArcSwap<Snapshot>>,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    generation: u64,
    entries: HashMap<CacheKey, CachedKey>,
}

impl Snapshot {
    fn invalidated(&self, keep: impl Fn(&CacheKey, &CachedKey) -> bool) -> Self {
        Self {
            generation: self.generation.wrapping_add(1),
            entries: self
                .entries
                .iter()
                .filter(|(k, v)| keep(*k, *v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl KeyCache {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(Snapshot::default())),
        }
    }

    /// Return the number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.load().entries.len()
    }

    /// Return `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.load().entries.is_empty()
    }

    /// Look up `key`.
    ///
    /// This is a lock-free read; the returned entry is a clone.
    pub fn get(&self, key: &CacheKey) -> Option<CachedKey> {
        self.inner.load().entries.get(key).cloned()
    }

    /// Current invalidation generation. Capture it before reading the store
    /// and hand it to [`KeyCache::put_if_unchanged`].
    pub fn generation(&self) -> u64 {
        self.inner.load().generation
    }

    /// Insert or replace `key` unconditionally.
    ///
    /// Only for values taken from a store write that has just succeeded.
    pub fn put(&self, key: CacheKey, entry: CachedKey) {
        self.inner.rcu(|snap| {
            let mut next = Snapshot::clone(snap);
            next.entries.insert(key.clone(), entry.clone());
            next
        });
    }

    /// Insert `key` only if no invalidation happened since `generation` was
    /// read. Returns `true` if the entry was stored.
    pub fn put_if_unchanged(&self, key: CacheKey, entry: CachedKey, generation: u64) -> bool {
        let previous = self.inner.rcu(|snap| {
            if snap.generation != generation {
                return Arc::clone(snap);
            }
            let mut next = Snapshot::clone(snap);
            next.entries.insert(key.clone(), entry.clone());
            Arc::new(next)
        });
        previous.generation == generation
    }

    /// Drop a single entry.
    pub fn invalidate(&self, key: &CacheKey) {
        self.inner.rcu(|snap| snap.invalidated(|k, _| k != key));
    }

    /// Drop the type's active slot and every by-id entry of that type.
    pub fn invalidate_type(&self, key_type: KeyType) {
        self.inner.rcu(|snap| {
            snap.invalidated(|k, v| {
                v.metadata.key_type != key_type && *k != CacheKey::ActiveOfType(key_type)
            })
        });
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner.rcu(|snap| snap.invalidated(|_, _| false));
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}
