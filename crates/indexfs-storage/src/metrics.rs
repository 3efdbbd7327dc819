//! File system metrics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters of a file system, shared by its thread-own forks
#[derive(Debug, Default)]
pub struct FsCounters {
    pub readers_opened: AtomicU64,
    pub writers_opened: AtomicU64,
    pub bytes_written: AtomicU64,
    pub files_removed: AtomicU64,
    pub syncs: AtomicU64,
    pub flushed_files: AtomicU64,
}

impl FsCounters {
    pub fn inc(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Point-in-time view of a file system
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileSystemMetrics {
    pub file_count: u64,
    pub dir_count: u64,
    /// Bytes of files held in memory
    pub mem_file_bytes: u64,

    pub node_cache_nodes: u64,
    pub node_cache_hits: u64,
    pub node_cache_misses: u64,
    pub node_cache_replaces: u64,
    pub node_memory_use: u64,

    pub block_cache_hits: u64,
    pub block_cache_misses: u64,
    pub block_cache_memory_use: u64,

    pub resource_count: u64,
    pub resource_memory_use: u64,

    pub quota_used: u64,
    /// 0 when unlimited
    pub quota_limit: u64,

    pub package_dirs: u64,
    pub staged_package_files: u64,
    pub pending_flush_tasks: u64,

    pub readers_opened: u64,
    pub writers_opened: u64,
    pub bytes_written: u64,
    pub files_removed: u64,
    pub syncs: u64,
    pub flushed_files: u64,
}

impl FileSystemMetrics {
    pub(crate) fn with_counters(mut self, counters: &FsCounters) -> Self {
        self.readers_opened = counters.readers_opened.load(Ordering::Relaxed);
        self.writers_opened = counters.writers_opened.load(Ordering::Relaxed);
        self.bytes_written = counters.bytes_written.load(Ordering::Relaxed);
        self.files_removed = counters.files_removed.load(Ordering::Relaxed);
        self.syncs = counters.syncs.load(Ordering::Relaxed);
        self.flushed_files = counters.flushed_files.load(Ordering::Relaxed);
        self
    }

    /// Node cache hit ratio (0.0 - 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn node_cache_hit_ratio(&self) -> f64 {
        let total = self.node_cache_hits + self.node_cache_misses + self.node_cache_replaces;
        if total == 0 {
            0.0
        } else {
            self.node_cache_hits as f64 / total as f64
        }
    }
}
