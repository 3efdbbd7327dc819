//! Storage backends
//!
//! Disk files map 1:1 to local files. Mem files live in a buffer until a
//! sync flushes them. Package files are staged in memory and packed into
//! shared data shards plus one meta file per package directory.

pub mod disk;
pub mod mem;
pub mod package;

use crate::memory::MemoryReservation;
use bytes::Bytes;
use indexfs_common::Result;
use std::fmt;
use std::path::PathBuf;

/// What a writer produced once closed
#[derive(Debug)]
pub enum ClosedContent {
    /// Bytes landed in this local file
    Disk { physical_path: PathBuf },
    /// Bytes are held in memory, accounted by `reservation`
    Mem {
        data: Bytes,
        reservation: Option<MemoryReservation>,
    },
}

/// A file handed over by a closing writer
#[derive(Debug)]
pub struct ClosedFile {
    pub logical_path: String,
    pub length: u64,
    pub content: ClosedContent,
}

/// Called by a writer on close to publish its file
pub struct CloseHook(Box<dyn FnOnce(ClosedFile) -> Result<()> + Send>);

impl CloseHook {
    pub fn new(hook: impl FnOnce(ClosedFile) -> Result<()> + Send + 'static) -> Self {
        Self(Box::new(hook))
    }

    /// Hook that drops the file, for writers nobody observes
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_| Ok(()))
    }

    pub fn call(self, file: ClosedFile) -> Result<()> {
        (self.0)(file)
    }
}

impl fmt::Debug for CloseHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CloseHook")
    }
}
