//! Configuration types for IndexFS
//!
//! These are the plain, serializable settings of a logical file system.
//! Load strategies are configured separately through the load config JSON.

use serde::{Deserialize, Serialize};

/// Where newly written files land
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStorage {
    /// Straight to the local disk
    Disk,
    /// Kept in memory until flushed by `sync`
    Mem,
    /// Packed into package data/meta files
    PackageMem,
}

impl Default for OutputStorage {
    fn default() -> Self {
        Self::Disk
    }
}

/// Settings of a logical file system instance
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemConfig {
    /// Backend for new files
    pub output_storage: OutputStorage,
    /// Share materialized file nodes through the node cache
    pub use_cache: bool,
    /// Flush in-memory files to disk on sync
    pub need_flush: bool,
    /// Flush on a background worker instead of the calling thread
    pub enable_async_flush: bool,
    /// Offline builds never lock memory
    pub is_offline: bool,
    /// Memory quota for mem files, slices, resources and block caches (0 = unlimited)
    pub memory_quota_bytes: u64,
    /// Block cache size used when a cache strategy gives none
    pub default_block_cache_bytes: u64,
    /// Block size used when a cache strategy gives none
    pub default_block_size: usize,
    /// Copy in-memory buffers when flushing instead of handing them over
    pub copy_on_dump: bool,
    /// Write disk files to a temp name and rename on close
    pub atomic_dump: bool,
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        Self {
            output_storage: OutputStorage::Disk,
            use_cache: true,
            need_flush: true,
            enable_async_flush: false,
            is_offline: false,
            memory_quota_bytes: 0,
            default_block_cache_bytes: 64 * 1024 * 1024, // 64 MB
            default_block_size: 4096,
            copy_on_dump: false,
            atomic_dump: true,
        }
    }
}

impl FileSystemConfig {
    /// Config for an in-memory building segment
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            output_storage: OutputStorage::Mem,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FileSystemConfig::default();
        assert_eq!(config.output_storage, OutputStorage::Disk);
        assert!(config.use_cache);
        assert!(config.atomic_dump);
        assert_eq!(config.memory_quota_bytes, 0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FileSystemConfig =
            serde_json::from_str(r#"{"output_storage":"package_mem","enable_async_flush":true}"#)
                .unwrap();
        assert_eq!(config.output_storage, OutputStorage::PackageMem);
        assert!(config.enable_async_flush);
        assert_eq!(config.default_block_size, 4096);
    }
}
