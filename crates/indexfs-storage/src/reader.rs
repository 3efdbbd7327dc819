//! File readers

use crate::cache::BlockAccessCounter;
use crate::compress::CompressFileReader;
use crate::file_node::FileNode;
use bytes::Bytes;
use indexfs_common::{FsFileType, FsOpenType, Result};
use std::sync::Arc;

/// One request of a batch read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleIo {
    pub offset: u64,
    pub len: usize,
}

impl SingleIo {
    pub const fn new(offset: u64, len: usize) -> Self {
        Self { offset, len }
    }
}

/// Options of [`crate::LogicalFileSystem::create_file_reader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOption {
    pub open_type: FsOpenType,
    /// Open compressed files through a decompressing reader
    pub support_compress: bool,
}

impl ReaderOption {
    pub const fn new(open_type: FsOpenType) -> Self {
        Self {
            open_type,
            support_compress: true,
        }
    }

    /// Resolve the open type through the load configs
    pub const fn load_config() -> Self {
        Self::new(FsOpenType::LoadConfig)
    }

    /// Read the raw bytes even when the file is compressed
    pub const fn no_compress(open_type: FsOpenType) -> Self {
        Self {
            open_type,
            support_compress: false,
        }
    }
}

impl Default for ReaderOption {
    fn default() -> Self {
        Self::load_config()
    }
}

#[derive(Debug, Clone)]
enum ReaderKind {
    Node(Arc<FileNode>),
    Compressed(CompressFileReader),
}

/// Reader of one logical file
///
/// Readers are stateless and cheap to clone; concurrent reads against one
/// reader never interfere.
#[derive(Debug, Clone)]
pub struct FileReader {
    path: String,
    kind: ReaderKind,
}

impl FileReader {
    pub(crate) fn from_node(path: impl Into<String>, node: Arc<FileNode>) -> Self {
        Self {
            path: path.into(),
            kind: ReaderKind::Node(node),
        }
    }

    pub(crate) fn from_compressed(path: impl Into<String>, reader: CompressFileReader) -> Self {
        Self {
            path: path.into(),
            kind: ReaderKind::Compressed(reader),
        }
    }

    pub fn logical_path(&self) -> &str {
        &self.path
    }

    /// Logical length, decompressed for compressed files
    pub fn length(&self) -> u64 {
        match &self.kind {
            ReaderKind::Node(node) => node.length(),
            ReaderKind::Compressed(reader) => reader.logic_length(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.kind, ReaderKind::Compressed(_))
    }

    /// Node of an uncompressed file
    pub fn file_node(&self) -> Option<&Arc<FileNode>> {
        match &self.kind {
            ReaderKind::Node(node) => Some(node),
            ReaderKind::Compressed(_) => None,
        }
    }

    pub fn compress_reader(&self) -> Option<&CompressFileReader> {
        match &self.kind {
            ReaderKind::Compressed(reader) => Some(reader),
            ReaderKind::Node(_) => None,
        }
    }

    /// Representation of the underlying node; `None` for compressed files
    pub fn file_type(&self) -> Option<FsFileType> {
        self.file_node().map(|node| node.file_type())
    }

    /// Fill `buf` from `offset`; fails unless the whole range exists
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        match &self.kind {
            ReaderKind::Node(node) => node.read(buf, offset),
            ReaderKind::Compressed(reader) => reader.read(buf, offset),
        }
    }

    pub fn read_with_counter(
        &self,
        buf: &mut [u8],
        offset: u64,
        counter: &mut BlockAccessCounter,
    ) -> Result<()> {
        match &self.kind {
            ReaderKind::Node(node) => node.read_with_counter(buf, offset, counter),
            ReaderKind::Compressed(reader) => reader.read_with_counter(buf, offset, counter),
        }
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Bytes> {
        match &self.kind {
            ReaderKind::Node(node) => node.read_bytes(offset, len),
            ReaderKind::Compressed(reader) => reader.read_bytes(offset, len),
        }
    }

    /// Serve each request independently
    pub fn batch_read(&self, ios: &[SingleIo]) -> Vec<Result<Bytes>> {
        match &self.kind {
            ReaderKind::Node(node) => ios
                .iter()
                .map(|io| node.read_bytes(io.offset, io.len))
                .collect(),
            ReaderKind::Compressed(reader) => reader.batch_read(ios),
        }
    }

    /// Whole file as bytes
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_all(&self) -> Result<Bytes> {
        self.read_bytes(0, self.length() as usize)
    }
}
