//! Block cache for file reads
//!
//! Holds fixed-size blocks keyed by (file identity, block index). Cache
//! strategy file nodes keep raw file blocks here; compressed readers in
//! decompress-cached mode keep decompressed blocks here.
//!
//! Returned blocks are `Bytes` handles: evicting an entry never invalidates
//! a buffer a reader already holds, it only stops new lookups from seeing it.

use crate::memory::{MemoryQuota, MemoryReservation};
use bytes::Bytes;
use indexfs_common::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key identifies a block of one physical file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_id: u64,
    pub block_idx: u64,
}

impl CacheKey {
    #[must_use]
    pub const fn new(file_id: u64, block_idx: u64) -> Self {
        Self { file_id, block_idx }
    }
}

/// Individual cache entry with LRU tracking
struct CacheEntry {
    data: Bytes,
    /// Logical clock value of the last access
    last_access: AtomicU64,
}

impl CacheEntry {
    fn new(data: Bytes, clock: u64) -> Self {
        Self {
            data,
            last_access: AtomicU64::new(clock),
        }
    }

    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    /// Inserts that overwrote an entry already present
    pub replaces: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.replaces.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// Per-read block access counters
///
/// `no_new_block` counts block touches served from blocks the same read
/// already fetched, which cost no cache traffic at all.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockAccessCounter {
    pub hit: u64,
    pub miss: u64,
    pub no_new_block: u64,
}

impl BlockAccessCounter {
    pub const fn merge(&mut self, other: Self) {
        self.hit += other.hit;
        self.miss += other.miss;
        self.no_new_block += other.no_new_block;
    }

    /// Total block cache lookups
    pub const fn cache_access(&self) -> u64 {
        self.hit + self.miss
    }
}

/// LRU block cache bounded by memory
pub struct BlockCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    block_size: usize,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    stats: CacheStats,
    _reservation: Option<MemoryReservation>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("capacity_bytes", &self.capacity_bytes)
            .field("used_bytes", &self.memory_use())
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    /// Cache holding at most `capacity_bytes` of block data
    #[must_use]
    pub fn with_capacity_bytes(capacity_bytes: u64, block_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            block_size,
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
            _reservation: None,
        }
    }

    /// Cache whose whole capacity is reserved from `quota` up front
    pub fn with_quota(
        capacity_bytes: u64,
        block_size: usize,
        quota: &Arc<MemoryQuota>,
    ) -> Result<Self> {
        let reservation = quota.reserve(capacity_bytes)?;
        let mut cache = Self::with_capacity_bytes(capacity_bytes, block_size);
        cache._reservation = Some(reservation);
        Ok(cache)
    }

    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    pub const fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Bytes of block data currently held
    pub fn memory_use(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a block in the cache
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(key) {
            entry.touch(self.tick());
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.data.clone())
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Insert a block, returning whether an existing entry was replaced
    ///
    /// A block larger than the whole capacity is not cached.
    pub fn insert(&self, key: CacheKey, data: Bytes) -> bool {
        let size = data.len() as u64;
        if size > self.capacity_bytes {
            return false;
        }
        let clock = self.tick();
        let mut entries = self.entries.write();

        if let Some(old) = entries.remove(&key) {
            self.used_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
            self.used_bytes.fetch_add(size, Ordering::Relaxed);
            entries.insert(key, CacheEntry::new(data, clock));
            self.stats.replaces.fetch_add(1, Ordering::Relaxed);
            self.evict_over_capacity(&mut entries, &key);
            return true;
        }

        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        entries.insert(key, CacheEntry::new(data, clock));
        self.evict_over_capacity(&mut entries, &key);
        false
    }

    fn evict_over_capacity(&self, entries: &mut HashMap<CacheKey, CacheEntry>, keep: &CacheKey) {
        while self.used_bytes.load(Ordering::Relaxed) > self.capacity_bytes {
            let Some(evict_key) = Self::find_lru_entry(entries, keep) else {
                break;
            };
            if let Some(entry) = entries.remove(&evict_key) {
                self.used_bytes
                    .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn find_lru_entry(entries: &HashMap<CacheKey, CacheEntry>, keep: &CacheKey) -> Option<CacheKey> {
        entries
            .iter()
            .filter(|(key, _)| *key != keep)
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| *key)
    }

    /// Remove a block from the cache
    pub fn invalidate(&self, key: &CacheKey) -> Option<Bytes> {
        let removed = self.entries.write().remove(key)?;
        self.used_bytes
            .fetch_sub(removed.data.len() as u64, Ordering::Relaxed);
        Some(removed.data)
    }

    /// Drop every block of one file
    pub fn invalidate_file(&self, file_id: u64) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let mut freed = 0u64;
        entries.retain(|key, entry| {
            if key.file_id == file_id {
                freed += entry.data.len() as u64;
                false
            } else {
                true
            }
        });
        self.used_bytes.fetch_sub(freed, Ordering::Relaxed);
        before - entries.len()
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.used_bytes.store(0, Ordering::Relaxed);
    }
}

/// Process-wide cache shared by every file system it is handed to
///
/// Cache strategies with `global_cache` set use this cache instead of one
/// owned by their load config scope.
#[derive(Debug, Clone)]
pub struct GlobalCacheHandle(Arc<BlockCache>);

impl GlobalCacheHandle {
    #[must_use]
    pub fn new(capacity_bytes: u64, block_size: usize) -> Self {
        Self(Arc::new(BlockCache::with_capacity_bytes(
            capacity_bytes,
            block_size,
        )))
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.0
    }
}

/// Caches of one file system, one per load config scope
///
/// Keyed by load config name; the `global_cache` option resolves to the
/// global handle instead.
#[derive(Debug)]
pub(crate) struct CacheRegistry {
    scoped: RwLock<HashMap<String, Arc<BlockCache>>>,
    global: Option<GlobalCacheHandle>,
    quota: Arc<MemoryQuota>,
}

impl CacheRegistry {
    pub(crate) fn new(global: Option<GlobalCacheHandle>, quota: Arc<MemoryQuota>) -> Self {
        Self {
            scoped: RwLock::new(HashMap::new()),
            global,
            quota,
        }
    }

    /// Registry sharing the global cache but none of the scoped caches
    pub(crate) fn fork(&self) -> Self {
        Self::new(self.global.clone(), Arc::clone(&self.quota))
    }

    /// Cache of a load config scope, created on first use
    pub(crate) fn get_or_create(
        &self,
        scope: &str,
        capacity_bytes: u64,
        block_size: usize,
        use_global: bool,
    ) -> Result<Arc<BlockCache>> {
        if use_global {
            if let Some(global) = &self.global {
                return Ok(Arc::clone(global.cache()));
            }
        }
        if let Some(cache) = self.scoped.read().get(scope) {
            return Ok(Arc::clone(cache));
        }
        let mut scoped = self.scoped.write();
        if let Some(cache) = scoped.get(scope) {
            return Ok(Arc::clone(cache));
        }
        let cache = Arc::new(BlockCache::with_quota(
            capacity_bytes,
            block_size,
            &self.quota,
        )?);
        tracing::debug!(
            "Created block cache for {}: {} bytes, block size {}",
            scope,
            capacity_bytes,
            block_size
        );
        scoped.insert(scope.to_string(), Arc::clone(&cache));
        Ok(cache)
    }

    /// Sum of memory used by every cache reachable from this registry
    pub(crate) fn memory_use(&self) -> u64 {
        let scoped: u64 = self.scoped.read().values().map(|c| c.memory_use()).sum();
        scoped + self.global.as_ref().map_or(0, |g| g.cache().memory_use())
    }

    pub(crate) fn stats(&self) -> (u64, u64) {
        let mut hits = 0;
        let mut misses = 0;
        let scoped = self.scoped.read();
        for cache in scoped
            .values()
            .chain(self.global.as_ref().map(GlobalCacheHandle::cache))
        {
            hits += cache.stats().hits.load(Ordering::Relaxed);
            misses += cache.stats().misses.load(Ordering::Relaxed);
        }
        (hits, misses)
    }

    pub(crate) fn invalidate_file(&self, file_id: u64) {
        for cache in self.scoped.read().values() {
            cache.invalidate_file(file_id);
        }
        if let Some(global) = &self.global {
            global.cache().invalidate_file(file_id);
        }
    }

    pub(crate) fn clear(&self) {
        for cache in self.scoped.read().values() {
            cache.clear();
        }
    }
}
