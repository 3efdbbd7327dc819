//! File writers

use indexfs_common::{FsStorageType, Result};
use std::collections::HashMap;
use std::fmt;

/// Sequential writer of one logical file
///
/// Writers are single-threaded: one writer per logical path, and the file
/// becomes visible to readers once `close` returns.
pub trait FileWriter: Send + fmt::Debug {
    fn logical_path(&self) -> &str;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes written to the physical file
    fn length(&self) -> u64;

    /// Bytes the caller handed to `write`
    fn logic_length(&self) -> u64 {
        self.length()
    }

    /// Finish the file; later calls are no-ops
    fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Options of [`crate::LogicalFileSystem::create_file_writer`]
#[derive(Debug, Clone, Default)]
pub struct WriterOption {
    /// Write to a temp name and rename on close, overrides the config
    pub atomic_dump: Option<bool>,
    /// Copy the in-memory buffer when flushing, overrides the config
    pub copy_on_dump: Option<bool>,
    /// Force a storage backend instead of the configured output storage
    pub storage: Option<FsStorageType>,
    /// Compress the file with this compressor
    pub compressor: Option<String>,
    pub compress_block_size: Option<usize>,
    pub compressor_params: HashMap<String, String>,
}

impl WriterOption {
    /// Uncompressed file on the configured storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compressed file
    #[must_use]
    pub fn compress(compressor: impl Into<String>, block_size: usize) -> Self {
        Self {
            compressor: Some(compressor.into()),
            compress_block_size: Some(block_size),
            ..Self::default()
        }
    }

    /// Keep the file in memory until the next sync
    #[must_use]
    pub fn mem() -> Self {
        Self {
            storage: Some(FsStorageType::Mem),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_atomic_dump(mut self, atomic: bool) -> Self {
        self.atomic_dump = Some(atomic);
        self
    }

    #[must_use]
    pub const fn with_storage(mut self, storage: FsStorageType) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.compressor_params.insert(key.into(), value.to_string());
        self
    }
}
