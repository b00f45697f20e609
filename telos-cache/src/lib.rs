//! # TELOS Cache - L1 Vector Cache
//!
//! Bounded map from concept id to dense vector. Reads are lock-free (shard
//! map lookup plus an atomic recency bump); writes serialize on a per-shard
//! lock chosen by id hash. Capacity is measured in bytes, not entries;
//! eviction removes the least-recently-used entry from the shard with the
//! highest utilization until the cache is back under budget.
//!
//! `invalidate` is synchronous and idempotent: when it returns, no reader
//! can observe the invalidated entry.

use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use telos_kernel::ConceptId;
use tracing::trace;

const SHARD_COUNT: usize = 16;

/// Cache counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheStats {
    /// Successful lookups
    pub hits: u64,
    /// Missed lookups
    pub misses: u64,
    /// Entries removed by capacity pressure
    pub evictions: u64,
    /// Bytes currently cached
    pub size_bytes: usize,
    /// Entries currently cached
    pub entries: usize,
}

struct CacheEntry {
    vector: Arc<Vec<f32>>,
    bytes: usize,
    last_used: AtomicU64,
}

struct Shard {
    entries: DashMap<ConceptId, CacheEntry>,
    bytes: AtomicUsize,
    write_lock: Mutex<()>,
}

impl Shard {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            bytes: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        }
    }
}

/// Byte-bounded sharded LRU over dense vectors.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct VectorCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    shards: Vec<Shard>,
    hasher: RandomState,
    capacity_bytes: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl VectorCache {
    /// Create a cache bounded to `capacity_bytes`
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                shards: (0..SHARD_COUNT).map(|_| Shard::new()).collect(),
                hasher: RandomState::new(),
                capacity_bytes: capacity_bytes.max(1),
                clock: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    fn shard_of(&self, id: ConceptId) -> &Shard {
        let mut hasher = self.inner.hasher.build_hasher();
        id.hash(&mut hasher);
        &self.inner.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    fn tick(&self) -> u64 {
        self.inner.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a vector; bumps recency on hit
    pub fn get(&self, id: ConceptId) -> Option<Arc<Vec<f32>>> {
        let shard = self.shard_of(id);
        match shard.entries.get(&id) {
            Some(entry) => {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.vector))
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace a vector, evicting under capacity pressure
    pub fn put(&self, id: ConceptId, vector: Vec<f32>) {
        let bytes = vector.len() * std::mem::size_of::<f32>();
        let shard = self.shard_of(id);
        {
            let _write = shard.write_lock.lock();
            let entry = CacheEntry {
                vector: Arc::new(vector),
                bytes,
                last_used: AtomicU64::new(self.tick()),
            };
            if let Some(previous) = shard.entries.insert(id, entry) {
                shard.bytes.fetch_sub(previous.bytes, Ordering::Relaxed);
            }
            shard.bytes.fetch_add(bytes, Ordering::Relaxed);
        }
        self.enforce_capacity();
    }

    /// Remove an entry. Synchronous and idempotent.
    pub fn invalidate(&self, id: ConceptId) {
        let shard = self.shard_of(id);
        let _write = shard.write_lock.lock();
        if let Some((_, entry)) = shard.entries.remove(&id) {
            shard.bytes.fetch_sub(entry.bytes, Ordering::Relaxed);
            trace!(%id, "cache entry invalidated");
        }
    }

    /// Total bytes currently cached
    pub fn size_bytes(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.bytes.load(Ordering::Relaxed))
            .sum()
    }

    /// Entries currently cached
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.entries.len()).sum()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters snapshot
    pub fn snapshot_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            size_bytes: self.size_bytes(),
            entries: self.len(),
        }
    }

    fn enforce_capacity(&self) {
        while self.size_bytes() > self.inner.capacity_bytes {
            let Some(shard) = self
                .inner
                .shards
                .iter()
                .filter(|s| !s.entries.is_empty())
                .max_by_key(|s| s.bytes.load(Ordering::Relaxed))
            else {
                return;
            };

            let _write = shard.write_lock.lock();
            let victim = shard
                .entries
                .iter()
                .min_by_key(|e| e.value().last_used.load(Ordering::Relaxed))
                .map(|e| *e.key());
            let Some(victim) = victim else {
                return;
            };
            if let Some((_, entry)) = shard.entries.remove(&victim) {
                shard.bytes.fetch_sub(entry.bytes, Ordering::Relaxed);
                self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(id = %victim, "evicted least-recently-used entry");
            }
        }
    }
}
