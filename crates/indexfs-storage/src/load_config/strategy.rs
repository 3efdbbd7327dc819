//! Load strategies
//!
//! A load strategy describes how a physical file is materialized into a
//! file node. The set is closed: the strategy is matched once when a file
//! is opened and the resulting node type is fixed from then on.

use indexfs_common::{Error, FsFileType, FsOpenType, Result};
use std::time::Duration;

use crate::layout::ALIGNMENT;

/// Upper bound of the mmap lock slice
pub const MAX_LOCK_SLICE: u64 = 64 * 1024 * 1024;

/// Default mmap lock slice (4MB)
pub const DEFAULT_LOCK_SLICE: u64 = 4 * 1024 * 1024;

/// Default cache block size (4KB)
pub const DEFAULT_CACHE_BLOCK_SIZE: usize = 4096;

/// Default buffered read size (2MB)
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Map the file into memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapLoadStrategy {
    /// Lock mapped pages in memory
    pub lock: bool,
    /// Hint random access to the kernel
    pub advise_random: bool,
    /// Bytes locked per step
    pub slice: u64,
    /// Pause between lock steps in milliseconds, 0 disables throttling
    pub interval: u64,
}

impl Default for MmapLoadStrategy {
    fn default() -> Self {
        Self {
            lock: false,
            advise_random: false,
            slice: DEFAULT_LOCK_SLICE,
            interval: 0,
        }
    }
}

impl MmapLoadStrategy {
    /// Locked mapping
    #[must_use]
    pub fn locked() -> Self {
        Self {
            lock: true,
            ..Self::default()
        }
    }

    /// Pause to apply between two lock slices
    ///
    /// `speed_limit_on` is the current value of the owning list's flag;
    /// `interval == 0` disables throttling whatever the flag says.
    #[must_use]
    pub const fn lock_throttle(&self, speed_limit_on: bool) -> Option<Duration> {
        if self.interval == 0 || !speed_limit_on {
            None
        } else {
            Some(Duration::from_millis(self.interval))
        }
    }

    fn check(&self) -> Result<()> {
        if self.slice > MAX_LOCK_SLICE {
            return Err(Error::bad_parameter(format!(
                "mmap lock slice {} exceeds limit {}",
                self.slice, MAX_LOCK_SLICE
            )));
        }
        if self.lock && self.slice == 0 {
            return Err(Error::bad_parameter("mmap lock slice must be positive"));
        }
        Ok(())
    }
}

/// Serve reads through a block cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLoadStrategy {
    /// Cached block size
    pub block_size: usize,
    /// Cache memory budget in bytes
    pub memory_size_bytes: u64,
    /// Cache decompressed blocks of compressed files
    pub cache_decompress_file: bool,
    /// Share one cache between all files and file systems using it
    pub global_cache: bool,
    /// Bypass the page cache
    pub direct_io: bool,
    /// Blocks fetched per underlying read
    pub io_batch_size: usize,
}

impl Default for CacheLoadStrategy {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_CACHE_BLOCK_SIZE,
            memory_size_bytes: 64 * 1024 * 1024,
            cache_decompress_file: false,
            global_cache: false,
            direct_io: false,
            io_batch_size: 4,
        }
    }
}

impl CacheLoadStrategy {
    fn check(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::bad_parameter(format!(
                "cache block size {} must be a power of two",
                self.block_size
            )));
        }
        if self.direct_io && self.block_size % ALIGNMENT != 0 {
            return Err(Error::bad_parameter(format!(
                "direct io needs block size aligned to {ALIGNMENT}, got {}",
                self.block_size
            )));
        }
        if self.memory_size_bytes < self.block_size as u64 {
            return Err(Error::bad_parameter(format!(
                "cache memory {} is smaller than one block of {}",
                self.memory_size_bytes, self.block_size
            )));
        }
        if self.io_batch_size == 0 {
            return Err(Error::bad_parameter("io batch size must be positive"));
        }
        Ok(())
    }
}

/// Read-through without caching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedLoadStrategy {
    pub buffer_size: usize,
    pub direct_io: bool,
}

impl Default for BufferedLoadStrategy {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            direct_io: false,
        }
    }
}

/// How a physical file becomes a file node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStrategy {
    Mmap(MmapLoadStrategy),
    Cache(CacheLoadStrategy),
    Buffered(BufferedLoadStrategy),
}

impl Default for LoadStrategy {
    fn default() -> Self {
        Self::Mmap(MmapLoadStrategy::default())
    }
}

impl LoadStrategy {
    pub const MMAP: &'static str = "mmap";
    pub const CACHE: &'static str = "cache";
    pub const BUFFERED: &'static str = "buffer";

    /// Stable discriminator used in JSON and for dispatch
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Mmap(_) => Self::MMAP,
            Self::Cache(_) => Self::CACHE,
            Self::Buffered(_) => Self::BUFFERED,
        }
    }

    /// Validate internal invariants
    pub fn check(&self) -> Result<()> {
        match self {
            Self::Mmap(s) => s.check(),
            Self::Cache(s) => s.check(),
            Self::Buffered(s) => {
                if s.buffer_size == 0 {
                    return Err(Error::bad_parameter("buffer size must be positive"));
                }
                Ok(())
            }
        }
    }

    /// Open type this strategy resolves `FsOpenType::LoadConfig` to
    #[must_use]
    pub const fn open_type(&self) -> FsOpenType {
        match self {
            Self::Mmap(_) => FsOpenType::Mmap,
            Self::Cache(_) => FsOpenType::Cache,
            Self::Buffered(_) => FsOpenType::Buffered,
        }
    }

    /// File node representation produced by this strategy
    #[must_use]
    pub const fn file_type(&self, is_offline: bool) -> FsFileType {
        match self {
            Self::Mmap(s) if s.lock && !is_offline => FsFileType::MmapLock,
            Self::Mmap(_) => FsFileType::Mmap,
            Self::Cache(_) => FsFileType::Block,
            Self::Buffered(_) => FsFileType::Buffered,
        }
    }

    /// Configured block cache memory, 0 for non-cache strategies
    #[must_use]
    pub const fn cache_memory_size(&self) -> u64 {
        match self {
            Self::Cache(s) => s.memory_size_bytes,
            _ => 0,
        }
    }
}
