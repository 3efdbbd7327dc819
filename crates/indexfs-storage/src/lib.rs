//! IndexFS Storage - logical file system core
//!
//! This crate implements the node-local storage substrate of IndexFS:
//! - Logical-to-physical path mapping over disk, memory and package files
//! - Load configs resolving a path to a load strategy (mmap, cache, buffered)
//! - Block cache and shared file node cache
//! - Block-compressed files with address mappers and hint data
//! - Directory facade and read-only link directories
//! - Async flush, fenced version commits and package recovery

pub mod cache;
pub mod compress;
pub mod directory;
pub mod downloader;
pub mod entry_table;
pub mod fence;
pub mod file_node;
pub mod file_system;
pub mod flush;
pub mod layout;
pub mod load_config;
pub mod memory;
pub mod metrics;
pub mod node_cache;
pub mod path;
pub mod raw_io;
pub mod reader;
pub mod resource;
pub mod slice;
pub mod storage;
pub mod writer;

// Re-exports
pub use cache::{BlockAccessCounter, BlockCache, CacheKey, CacheStats, GlobalCacheHandle};
pub use compress::{
    CompressFileAddressMapper, CompressFileInfo, CompressFileReader, CompressFileWriter,
    CompressMeta, Compressor, CompressorKind, CompressorParams,
};
pub use directory::{Directory, DirectoryKind, ReadOnlyDirectory};
pub use downloader::{ConfigDownloader, DownloadErrorCode};
pub use entry_table::{Entry, EntryTable, PersistedEntryTable, PhysicalLocation};
pub use fence::FenceContext;
pub use file_node::{FileNode, NodeContent, PhysicalSource};
pub use file_system::{
    ConflictPolicy, DirectoryOption, FileSystemOptions, LogicalFileSystem, MountOption,
    RemoveOption,
};
pub use flush::{FlushQueue, SyncFuture};
pub use load_config::{
    BufferedLoadStrategy, CacheLoadStrategy, LoadConfig, LoadConfigList, LoadStrategy,
    MmapLoadStrategy,
};
pub use memory::{MemoryQuota, MemoryReservation};
pub use metrics::FileSystemMetrics;
pub use node_cache::{FileNodeCache, NodeCacheStats};
pub use reader::{FileReader, ReaderOption, SingleIo};
pub use resource::ResourceFile;
pub use slice::SliceFile;
pub use storage::package::{PackageMeta, PackageState};
pub use writer::{FileWriter, WriterOption};
