//! Core type definitions for IndexFS
//!
//! Open types, file node representations, storage backends and the id
//! newtypes shared by the storage core and the framework layer.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Requested materialization of a file when it is opened for reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsOpenType {
    /// Read the whole file into a buffer
    Mem,
    /// Map the file, locking pages when the strategy asks for it
    Mmap,
    /// Serve reads through a block cache
    Cache,
    /// Read-through, no caching
    Buffered,
    /// Resolve through the load config list
    LoadConfig,
    /// Fixed-size pool-backed slices, never cached
    Slice,
    /// Typed in-memory resource attached to the file system
    Resource,
}

impl fmt::Display for FsOpenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mem => "mem",
            Self::Mmap => "mmap",
            Self::Cache => "cache",
            Self::Buffered => "buffered",
            Self::LoadConfig => "load_config",
            Self::Slice => "slice",
            Self::Resource => "resource",
        };
        f.write_str(s)
    }
}

/// Concrete representation of a materialized file node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsFileType {
    Mem,
    Mmap,
    MmapLock,
    Block,
    Buffered,
    Slice,
    Resource,
}

impl FsFileType {
    /// Whether a node of this type may be shared through the file node cache
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        !matches!(self, Self::Slice)
    }
}

impl fmt::Display for FsFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mem => "mem",
            Self::Mmap => "mmap",
            Self::MmapLock => "mmap_lock",
            Self::Block => "block",
            Self::Buffered => "buffered",
            Self::Slice => "slice",
            Self::Resource => "resource",
        };
        f.write_str(s)
    }
}

/// Physical backend a logical file lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsStorageType {
    Disk,
    Mem,
    Package,
}

/// Temperature tag of a directory, matched against load config lifecycles
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct Lifecycle(String);

impl Lifecycle {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn hot() -> Self {
        Self::new("hot")
    }

    #[must_use]
    pub fn cold() -> Self {
        Self::new("cold")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a committed version
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct VersionId(u64);

impl VersionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for VersionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Identifier of a segment inside a version
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct SegmentId(u64);

impl SegmentId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}
