//! File node cache
//!
//! Shares materialized file nodes between readers of the same logical
//! path. A lookup with the same representation returns the cached node; a
//! lookup with a different representation builds a new node and replaces
//! the cached one. Readers still holding the old node keep using it.

use crate::file_node::FileNode;
use crate::path::is_sub_path;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use indexfs_common::{FsFileType, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Node cache counters
#[derive(Debug, Default)]
pub struct NodeCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    /// Cached node replaced by one of another representation
    pub replaces: AtomicU64,
}

#[derive(Debug, Default)]
pub struct FileNodeCache {
    nodes: DashMap<String, Arc<FileNode>>,
    stats: NodeCacheStats,
}

impl FileNodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn stats(&self) -> &NodeCacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Cached node at `path`, when it has representation `file_type`
    pub fn get(&self, path: &str, file_type: FsFileType) -> Option<Arc<FileNode>> {
        self.nodes
            .get(path)
            .filter(|node| node.file_type() == file_type)
            .map(|node| Arc::clone(node.value()))
    }

    /// Cached node of the wanted representation, or a new one from `create`
    ///
    /// `create` runs without any cache lock held. When two threads race to
    /// create the same node, the first insert wins and both get it.
    pub fn get_or_create(
        &self,
        path: &str,
        file_type: FsFileType,
        create: impl FnOnce() -> Result<FileNode>,
    ) -> Result<Arc<FileNode>> {
        if !file_type.is_cacheable() {
            return create().map(Arc::new);
        }
        if let Some(node) = self.get(path, file_type) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(node);
        }

        let node = Arc::new(create()?);
        match self.nodes.entry(path.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().file_type() == file_type {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(entry.get()));
                }
                debug!(
                    "Replacing cached {} node of {} with {}",
                    entry.get().file_type(),
                    path,
                    file_type
                );
                entry.insert(Arc::clone(&node));
                self.stats.replaces.fetch_add(1, Ordering::Relaxed);
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&node));
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(node)
    }

    pub fn remove(&self, path: &str) -> Option<Arc<FileNode>> {
        self.nodes.remove(path).map(|(_, node)| node)
    }

    /// Drop every node at or below `dir`
    pub fn remove_dir(&self, dir: &str) {
        self.nodes.retain(|path, _| !is_sub_path(dir, path));
    }

    pub fn clear(&self) {
        self.nodes.clear();
    }

    /// Bytes held in memory by cached nodes
    pub fn memory_use(&self) -> u64 {
        self.nodes.iter().map(|node| node.memory_use()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use indexfs_common::Error;

    fn node(path: &str) -> Result<FileNode> {
        Ok(FileNode::mem(path, Bytes::from_static(b"data")))
    }

    #[test]
    fn test_hit_and_replace() {
        let cache = FileNodeCache::new();
        let a = cache.get_or_create("seg/a", FsFileType::Mem, || node("seg/a")).unwrap();
        let b = cache.get_or_create("seg/a", FsFileType::Mem, || node("seg/a")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);

        // A node that is not the requested representation forces a replace
        let c = cache
            .get_or_create("seg/a", FsFileType::Buffered, || node("seg/a"))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.stats().replaces.load(Ordering::Relaxed), 1);
        assert_eq!(cache.len(), 1);
        // The old node stays readable
        assert_eq!(a.read_bytes(0, 4).unwrap(), Bytes::from_static(b"data"));
    }

    #[test]
    fn test_slice_bypasses_cache() {
        let cache = FileNodeCache::new();
        cache.get_or_create("s", FsFileType::Slice, || node("s")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_create_error_not_cached() {
        let cache = FileNodeCache::new();
        let err = cache.get_or_create("x", FsFileType::Mem, || Err(Error::not_found("x")));
        assert!(err.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_dir() {
        let cache = FileNodeCache::new();
        for path in ["seg/a", "seg/b/c", "segment/a"] {
            cache.get_or_create(path, FsFileType::Mem, || node(path)).unwrap();
        }
        cache.remove_dir("seg");
        assert_eq!(cache.len(), 1);
        assert!(cache.get("segment/a", FsFileType::Mem).is_some());
        assert!(cache.remove("segment/a").is_some());
    }

    #[test]
    fn test_concurrent_get_or_create() {
        let cache = FileNodeCache::new();
        let nodes: Vec<Arc<FileNode>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        cache
                            .get_or_create("hot", FsFileType::Mem, || node("hot"))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let first = cache.get("hot", FsFileType::Mem).unwrap();
        assert!(nodes.iter().all(|n| Arc::ptr_eq(n, &first)));
    }
}
