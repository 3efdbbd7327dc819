//! Logical file system
//!
//! The single authority over the mapping from logical paths to physical
//! storage. Writers publish their file into the entry table when they
//! close; readers resolve the entry, pick a representation through the
//! load configs and share materialized nodes through the node cache.
//!
//! Lock order: `packages` before `entries`; `unflushed` and the resource
//! map are never held while taking another lock.

use crate::cache::{CacheRegistry, GlobalCacheHandle};
use crate::compress::{
    CompressFileInfo, CompressFileReader, CompressFileWriter, CompressMeta, Compressor,
    CompressorParams, INFO_META_FILE,
};
use crate::entry_table::{Entry, EntryTable, PersistedEntryTable, PhysicalLocation};
use crate::fence::FenceContext;
use crate::file_node::{FileNode, NodeContent, PhysicalSource};
use crate::flush::{FlushQueue, SyncFuture};
use crate::layout::{
    PACKAGE_META_FILE, ROOT_LINK_NAME, TEMP_FILE_MARKER, compress_info_path, compress_meta_path,
    compress_resource_path, is_package_file,
};
use crate::load_config::{CacheLoadStrategy, LoadConfigList, LoadStrategy, MmapLoadStrategy};
use crate::memory::MemoryQuota;
use crate::metrics::{FileSystemMetrics, FsCounters};
use crate::node_cache::FileNodeCache;
use crate::path::{
    ancestors, has_reserved_suffix, is_sub_path, join_path, normalize_path, parent_path,
    relative_to,
};
use crate::reader::{FileReader, ReaderOption};
use crate::resource::ResourceFile;
use crate::slice::SliceFile;
use crate::storage::disk::{DiskFileWriter, dump_file};
use crate::storage::mem::MemFileWriter;
use crate::storage::package::{PackageState, PackedEntry, remove_package_files};
use crate::storage::{CloseHook, ClosedContent, ClosedFile};
use crate::writer::{FileWriter, WriterOption};
use bytes::Bytes;
use dashmap::DashMap;
use indexfs_common::{
    Error, FileSystemConfig, FsFileType, FsOpenType, FsStorageType, Lifecycle, OutputStorage,
    Result,
};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Settings of a file system, fixed at creation
#[derive(Debug, Clone, Default)]
pub struct FileSystemOptions {
    pub config: FileSystemConfig,
    pub load_configs: LoadConfigList,
    /// Cache shared with other file systems by `global_cache` strategies
    pub global_cache: Option<GlobalCacheHandle>,
}

impl FileSystemOptions {
    pub fn new(config: FileSystemConfig, load_configs: LoadConfigList) -> Self {
        Self {
            config,
            load_configs,
            global_cache: None,
        }
    }

    #[must_use]
    pub fn with_global_cache(mut self, handle: GlobalCacheHandle) -> Self {
        self.global_cache = Some(handle);
        self
    }

    /// Validate the load configs and admit their caches against the quota
    pub fn check(&self) -> Result<()> {
        self.load_configs.check()?;
        let quota = self.config.memory_quota_bytes;
        let caches = self.load_configs.total_cache_memory_size();
        if quota > 0 && caches > quota {
            return Err(Error::bad_parameter(format!(
                "load configs need {caches} bytes of block cache, memory quota is {quota}"
            )));
        }
        if self.config.default_block_size == 0 {
            return Err(Error::bad_parameter("default block size must be positive"));
        }
        Ok(())
    }
}

/// What to do when a mounted entry meets an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The mounted entry wins
    #[default]
    Overwrite,
    /// The existing entry wins
    Skip,
    /// Fail with `AlreadyExists` unless both point at the same bytes
    CheckDiff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountOption {
    pub conflict: ConflictPolicy,
    /// Mount a placeholder instead of failing when the source is absent
    pub may_non_exist: bool,
}

impl MountOption {
    pub const fn new(conflict: ConflictPolicy) -> Self {
        Self {
            conflict,
            may_non_exist: false,
        }
    }

    #[must_use]
    pub const fn may_non_exist(mut self) -> Self {
        self.may_non_exist = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoveOption {
    /// Removing an absent path succeeds
    pub may_non_exist: bool,
}

impl RemoveOption {
    pub const fn may_non_exist() -> Self {
        Self {
            may_non_exist: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryOption {
    /// Create missing parents; an existing directory is not an error
    pub recursive: bool,
    /// Pack files written below the directory into package files
    pub package: bool,
}

impl DirectoryOption {
    pub const fn recursive() -> Self {
        Self {
            recursive: true,
            package: false,
        }
    }

    pub const fn package() -> Self {
        Self {
            recursive: true,
            package: true,
        }
    }
}

/// State shared by a file system and its thread-own forks
#[derive(Debug)]
struct FsShared {
    name: String,
    root: PathBuf,
    config: FileSystemConfig,
    load_configs: LoadConfigList,
    entries: RwLock<EntryTable>,
    /// Package directories by logical path
    packages: Mutex<BTreeMap<String, PackageState>>,
    lifecycles: RwLock<BTreeMap<String, Lifecycle>>,
    resources: DashMap<String, Arc<ResourceFile>>,
    /// Mem files not yet dumped by a sync
    unflushed: Mutex<BTreeSet<String>>,
    quota: Arc<MemoryQuota>,
    flush: Option<FlushQueue>,
    checkpoint: AtomicU64,
    counters: FsCounters,
}

impl FsShared {
    /// Write a mem file to disk and point its entry there, unless it
    /// changed in the meantime
    ///
    /// `payload` is what gets written; `original` identifies the entry.
    fn dump_mem_file(&self, path: &str, original: &Bytes, payload: &Bytes) -> Result<()> {
        let target = self.root.join(path);
        dump_file(&target, payload)?;
        let mut entries = self.entries.write();
        let unchanged = entries.get(path).is_some_and(|e| match &e.location {
            PhysicalLocation::Mem { data } => {
                data.as_ptr() == original.as_ptr() && data.len() == original.len()
            }
            _ => false,
        });
        if unchanged {
            entries.insert(
                path,
                Entry::file(PhysicalLocation::Disk { path: target }, payload.len() as u64),
            );
            FsCounters::inc(&self.counters.flushed_files, 1);
        }
        Ok(())
    }

    /// Make a closed file visible and drop the sidecars it supersedes
    fn publish(&self, path: &str, entry: Entry, stale: &[String]) -> Result<()> {
        let removed: Vec<Entry> = {
            let mut entries = self.entries.write();
            entries.insert(path, entry);
            stale.iter().filter_map(|p| entries.remove(p)).collect()
        };
        if removed.is_empty() {
            return Ok(());
        }
        {
            let mut unflushed = self.unflushed.lock();
            for p in stale {
                unflushed.remove(p);
            }
        }
        for entry in removed {
            if let (PhysicalLocation::Disk { path: physical }, false) =
                (&entry.location, entry.read_only)
            {
                remove_physical_file(physical)?;
            }
        }
        debug!("Dropped {} stale sidecars of {}", stale.len(), path);
        Ok(())
    }

    fn apply_packed(&self, dir: &str, packed: Vec<PackedEntry>) {
        let mut entries = self.entries.write();
        for entry in packed {
            let path = join_path(dir, &entry.name);
            let length = entry.length;
            entries.insert(
                &path,
                Entry::file(
                    PhysicalLocation::Package {
                        data_path: entry.data_path,
                        offset: entry.offset,
                        length,
                    },
                    length,
                ),
            );
        }
    }
}

/// Open type resolved against the load configs
#[derive(Debug)]
struct Resolved {
    open_type: FsOpenType,
    strategy: LoadStrategy,
    /// Cache scope: the matching config, or a per-strategy default
    scope: String,
}

#[derive(Debug)]
pub struct LogicalFileSystem {
    shared: Arc<FsShared>,
    node_cache: FileNodeCache,
    caches: CacheRegistry,
    session: Option<String>,
}

impl LogicalFileSystem {
    /// File system writing below the physical `root`
    pub fn create(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        options: FileSystemOptions,
    ) -> Result<Self> {
        options.check()?;
        let name = name.into();
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(root.to_string_lossy(), e))?;
        let quota = Arc::new(MemoryQuota::new(options.config.memory_quota_bytes));
        let flush = if options.config.enable_async_flush {
            Some(FlushQueue::start(&name)?)
        } else {
            None
        };
        info!(
            "Created file system {} at {} (output {:?}, async flush {})",
            name,
            root.display(),
            options.config.output_storage,
            options.config.enable_async_flush
        );
        let caches = CacheRegistry::new(options.global_cache, Arc::clone(&quota));
        Ok(Self {
            shared: Arc::new(FsShared {
                name,
                root,
                config: options.config,
                load_configs: options.load_configs,
                entries: RwLock::new(EntryTable::new()),
                packages: Mutex::new(BTreeMap::new()),
                lifecycles: RwLock::new(BTreeMap::new()),
                resources: DashMap::new(),
                unflushed: Mutex::new(BTreeSet::new()),
                quota,
                flush,
                checkpoint: AtomicU64::new(0),
                counters: FsCounters::default(),
            }),
            node_cache: FileNodeCache::new(),
            caches,
            session: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Physical root of written files
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn config(&self) -> &FileSystemConfig {
        &self.shared.config
    }

    pub fn load_configs(&self) -> &LoadConfigList {
        &self.shared.load_configs
    }

    pub fn quota(&self) -> &Arc<MemoryQuota> {
        &self.shared.quota
    }

    pub const fn node_cache(&self) -> &FileNodeCache {
        &self.node_cache
    }

    /// Session name of a thread-own file system
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Fork sharing every mount and file but with private caches
    ///
    /// Reads on the fork never contend on the base file system's node
    /// cache or scoped block caches; the global cache stays shared.
    #[must_use]
    pub fn create_thread_own_file_system(&self, name: &str) -> Self {
        debug!("Created thread-own file system {} of {}", name, self.name());
        Self {
            shared: Arc::clone(&self.shared),
            node_cache: FileNodeCache::new(),
            caches: self.caches.fork(),
            session: Some(name.to_string()),
        }
    }

    fn physical_path(&self, path: &str) -> PathBuf {
        self.shared.root.join(path)
    }

    /// Innermost package directory containing `path`
    fn package_dir_of(packages: &BTreeMap<String, PackageState>, path: &str) -> Option<String> {
        let mut found = None;
        for dir in ancestors(path) {
            if packages.contains_key(dir) {
                found = Some(dir.to_string());
            }
        }
        found
    }

    // ---------------------------------------------------------------
    // Writers
    // ---------------------------------------------------------------

    /// Writer of a new logical file; it becomes visible when closed
    pub fn create_file_writer(
        &self,
        path: &str,
        option: &WriterOption,
    ) -> Result<Box<dyn FileWriter>> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Err(Error::bad_parameter("cannot write the root directory"));
        }
        if has_reserved_suffix(&path) {
            return Err(Error::not_supported(format!(
                "{path} ends with a reserved suffix"
            )));
        }
        if self.shared.entries.read().is_dir(&path) {
            return Err(Error::AlreadyExists(format!("{path} is a directory")));
        }
        self.forget(&path);
        FsCounters::inc(&self.shared.counters.writers_opened, 1);

        let Some(compressor) = &option.compressor else {
            let stale = vec![compress_info_path(&path), compress_meta_path(&path)];
            return self.raw_writer(&path, option, stale);
        };
        let params = CompressorParams::from_map(&option.compressor_params)?;
        let compressor = Compressor::from_name(compressor, params.compress_level)?;
        let block_size = option
            .compress_block_size
            .unwrap_or(self.shared.config.default_block_size);
        let (meta, stale) = if params.enable_meta_file {
            let meta = self.raw_writer(&compress_meta_path(&path), option, Vec::new())?;
            (Some(meta), Vec::new())
        } else {
            (None, vec![compress_meta_path(&path)])
        };
        let data = self.raw_writer(&path, option, stale)?;
        let info = self.raw_writer(&compress_info_path(&path), option, Vec::new())?;
        Ok(Box::new(CompressFileWriter::new(
            path, data, info, meta, compressor, block_size, params,
        )?))
    }

    fn storage_for(&self, path: &str, option: &WriterOption) -> Result<FsStorageType> {
        if let Some(storage) = option.storage {
            return Ok(storage);
        }
        if Self::package_dir_of(&self.shared.packages.lock(), path).is_some() {
            return Ok(FsStorageType::Package);
        }
        Ok(match self.shared.config.output_storage {
            OutputStorage::Disk => FsStorageType::Disk,
            OutputStorage::Mem => FsStorageType::Mem,
            OutputStorage::PackageMem if path.contains('/') => FsStorageType::Package,
            OutputStorage::PackageMem => FsStorageType::Mem,
        })
    }

    /// Uncompressed writer of `path`; `stale` names the sidecars its close
    /// drops
    fn raw_writer(
        &self,
        path: &str,
        option: &WriterOption,
        stale: Vec<String>,
    ) -> Result<Box<dyn FileWriter>> {
        let shared = Arc::clone(&self.shared);
        match self.storage_for(path, option)? {
            FsStorageType::Disk => {
                let atomic = option.atomic_dump.unwrap_or(shared.config.atomic_dump);
                let hook = CloseHook::new(move |file: ClosedFile| {
                    let ClosedContent::Disk { physical_path } = file.content else {
                        return Err(Error::internal("disk writer produced memory content"));
                    };
                    FsCounters::inc(&shared.counters.bytes_written, file.length);
                    shared.publish(
                        &file.logical_path,
                        Entry::file(
                            PhysicalLocation::Disk {
                                path: physical_path,
                            },
                            file.length,
                        ),
                        &stale,
                    )
                });
                Ok(Box::new(DiskFileWriter::create(
                    path,
                    self.physical_path(path),
                    atomic,
                    true,
                    hook,
                )?))
            }
            FsStorageType::Mem => {
                let hook = CloseHook::new(move |file: ClosedFile| {
                    let ClosedContent::Mem { data, reservation } = file.content else {
                        return Err(Error::internal("mem writer produced disk content"));
                    };
                    FsCounters::inc(&shared.counters.bytes_written, file.length);
                    shared.publish(
                        &file.logical_path,
                        Entry::file(PhysicalLocation::Mem { data }, file.length)
                            .with_reservation(reservation),
                        &stale,
                    )?;
                    if shared.config.need_flush {
                        shared.unflushed.lock().insert(file.logical_path);
                    }
                    Ok(())
                });
                Ok(Box::new(MemFileWriter::create(path, &self.shared.quota, hook)?))
            }
            FsStorageType::Package => {
                let dir = self.ensure_package_dir(path)?;
                let name = relative_to(&dir, path)
                    .map(str::to_string)
                    .ok_or_else(|| Error::internal(format!("{path} outside package {dir}")))?;
                let stale_names: Vec<String> = stale
                    .iter()
                    .filter_map(|p| relative_to(&dir, p).map(str::to_string))
                    .collect();
                let hook = CloseHook::new(move |file: ClosedFile| {
                    let ClosedContent::Mem { data, reservation } = file.content else {
                        return Err(Error::internal("package writer produced disk content"));
                    };
                    let mut packages = shared.packages.lock();
                    let state = packages.get_mut(&dir).ok_or_else(|| {
                        Error::not_found(format!("package {dir} removed while writing"))
                    })?;
                    for stale_name in &stale_names {
                        state.remove(stale_name);
                    }
                    state.stage(name, data.clone());
                    FsCounters::inc(&shared.counters.bytes_written, file.length);
                    shared.publish(
                        &file.logical_path,
                        Entry::file(PhysicalLocation::Mem { data }, file.length)
                            .with_reservation(reservation),
                        &stale,
                    )
                });
                Ok(Box::new(MemFileWriter::create(path, &self.shared.quota, hook)?))
            }
        }
    }

    /// Package directory of `path`, created on first use
    fn ensure_package_dir(&self, path: &str) -> Result<String> {
        let mut packages = self.shared.packages.lock();
        if let Some(dir) = Self::package_dir_of(&packages, path) {
            return Ok(dir);
        }
        let dir = path
            .split_once('/')
            .map(|(first, _)| first.to_string())
            .ok_or_else(|| {
                Error::bad_parameter(format!("{path} has no directory to package into"))
            })?;
        self.register_package(&mut packages, &dir)?;
        Ok(dir)
    }

    fn register_package(
        &self,
        packages: &mut BTreeMap<String, PackageState>,
        dir: &str,
    ) -> Result<()> {
        let physical = self.physical_path(dir);
        fs::create_dir_all(&physical).map_err(|e| Error::io(physical.to_string_lossy(), e))?;
        packages.insert(dir.to_string(), PackageState::create(physical));
        self.shared.entries.write().add_dir(dir);
        debug!("Registered package directory {}", dir);
        Ok(())
    }

    /// Drop cached state of a path about to change
    fn forget(&self, path: &str) {
        if let Some(node) = self.node_cache.remove(path) {
            if let NodeContent::Block(block) = node.content() {
                self.caches.invalidate_file(block.file_id());
            }
        }
        self.node_cache.remove(&compress_info_path(path));
        self.node_cache.remove(&compress_meta_path(path));
        self.shared.resources.remove(&compress_resource_path(path));
    }

    // ---------------------------------------------------------------
    // Readers
    // ---------------------------------------------------------------

    /// Reader of a logical file
    ///
    /// Compressed files are detected through their info sidecar and read
    /// decompressed unless `support_compress` is off.
    pub fn create_file_reader(&self, path: &str, option: ReaderOption) -> Result<FileReader> {
        let path = normalize_path(path)?;
        FsCounters::inc(&self.shared.counters.readers_opened, 1);
        if option.open_type == FsOpenType::Resource {
            return Err(Error::not_supported(format!(
                "{path}: resources are read through get_or_create_resource"
            )));
        }
        let compressed = option.support_compress
            && self
                .shared
                .entries
                .read()
                .exists(&compress_info_path(&path));
        if compressed {
            let reader = self.open_compressed(&path, option.open_type)?;
            return Ok(FileReader::from_compressed(path, reader));
        }
        let node = self.open_node(&path, option.open_type)?;
        Ok(FileReader::from_node(path, node))
    }

    fn resolve(&self, path: &str, open_type: FsOpenType) -> Resolved {
        let lifecycle = self.get_file_lifecycle(path);
        let config = self
            .shared
            .load_configs
            .match_config(path, lifecycle.as_ref());
        let matched = config.strategy();
        let open_type = if open_type == FsOpenType::LoadConfig {
            matched.open_type()
        } else {
            open_type
        };
        let strategy = match (open_type, matched) {
            (FsOpenType::Mmap, LoadStrategy::Mmap(_))
            | (FsOpenType::Cache, LoadStrategy::Cache(_))
            | (FsOpenType::Buffered, LoadStrategy::Buffered(_)) => {
                return Resolved {
                    open_type,
                    strategy: matched.clone(),
                    scope: config.name().to_string(),
                };
            }
            (FsOpenType::Cache, _) => LoadStrategy::Cache(CacheLoadStrategy {
                block_size: self.shared.config.default_block_size,
                memory_size_bytes: self.shared.config.default_block_cache_bytes,
                ..CacheLoadStrategy::default()
            }),
            (FsOpenType::Buffered, _) => LoadStrategy::Buffered(Default::default()),
            _ => LoadStrategy::Mmap(MmapLoadStrategy::default()),
        };
        Resolved {
            open_type,
            scope: format!("__default_{}__", strategy.name()),
            strategy,
        }
    }

    /// File node of a logical file, shared through the node cache
    pub fn open_node(&self, path: &str, open_type: FsOpenType) -> Result<Arc<FileNode>> {
        let (location, length) = {
            let entries = self.shared.entries.read();
            match entries.get(path) {
                Some(entry) if entry.is_dir => {
                    return Err(Error::not_supported(format!("{path} is a directory")));
                }
                Some(entry) if entry.exists() => (entry.location.clone(), entry.length),
                _ => return Err(Error::not_found(path.to_string())),
            }
        };

        match location {
            PhysicalLocation::Mem { data } => {
                self.cached(path, FsFileType::Mem, || Ok(FileNode::mem(path, data)))
            }
            PhysicalLocation::Slice(slice) => Ok(Arc::new(FileNode::slice(path, slice))),
            PhysicalLocation::Missing => Err(Error::not_found(path.to_string())),
            PhysicalLocation::Disk { path: physical } => {
                self.open_physical(path, open_type, &physical, 0, length)
            }
            PhysicalLocation::Package {
                data_path,
                offset,
                length,
            } => self.open_physical(path, open_type, &data_path, offset, length),
        }
    }

    fn cached(
        &self,
        path: &str,
        file_type: FsFileType,
        create: impl FnOnce() -> Result<FileNode>,
    ) -> Result<Arc<FileNode>> {
        if self.shared.config.use_cache {
            self.node_cache.get_or_create(path, file_type, create)
        } else {
            create().map(Arc::new)
        }
    }

    fn open_physical(
        &self,
        path: &str,
        open_type: FsOpenType,
        physical: &Path,
        base: u64,
        length: u64,
    ) -> Result<Arc<FileNode>> {
        let resolved = self.resolve(path, open_type);
        let physical = physical.to_string_lossy();
        let source = PhysicalSource {
            path: &physical,
            base,
            length,
        };
        let shared = &self.shared;
        let is_offline = shared.config.is_offline;
        match (resolved.open_type, &resolved.strategy) {
            (FsOpenType::Mem, _) => self.cached(path, FsFileType::Mem, || {
                FileNode::load_mem(path, &source, &shared.quota)
            }),
            (FsOpenType::Mmap, LoadStrategy::Mmap(mmap)) => {
                let file_type = resolved.strategy.file_type(is_offline);
                self.cached(path, file_type, || {
                    FileNode::mmap(
                        path,
                        &source,
                        mmap,
                        file_type == FsFileType::MmapLock,
                        &shared.load_configs,
                        &shared.quota,
                    )
                })
            }
            (FsOpenType::Cache, LoadStrategy::Cache(cache)) => {
                self.cached(path, FsFileType::Block, || {
                    let block_cache = self.caches.get_or_create(
                        &resolved.scope,
                        cache.memory_size_bytes,
                        cache.block_size,
                        cache.global_cache,
                    )?;
                    FileNode::block(path, &source, block_cache, cache.io_batch_size, cache.direct_io)
                })
            }
            (FsOpenType::Buffered, LoadStrategy::Buffered(buffered)) => {
                self.cached(path, FsFileType::Buffered, || {
                    FileNode::buffered(path, &source, buffered.direct_io)
                })
            }
            (open_type, _) => Err(Error::not_supported(format!(
                "{path}: open type {open_type} on a physical file"
            ))),
        }
    }

    fn read_whole(&self, path: &str) -> Result<Bytes> {
        let node = self.open_node(path, FsOpenType::Mem)?;
        node.read_bytes(0, memory_len(path, node.length())?)
    }

    /// Compress info of `path`, `None` for uncompressed files
    pub fn compress_info(&self, path: &str) -> Result<Option<CompressFileInfo>> {
        let path = normalize_path(path)?;
        let info_path = compress_info_path(&path);
        if !self.shared.entries.read().exists(&info_path) {
            return Ok(None);
        }
        CompressFileInfo::from_json(&self.read_whole(&info_path)?).map(Some)
    }

    fn open_compressed(&self, path: &str, open_type: FsOpenType) -> Result<CompressFileReader> {
        let info = CompressFileInfo::from_json(&self.read_whole(&compress_info_path(path))?)?;
        let resolved = self.resolve(path, open_type);
        let decompress_cache = match &resolved.strategy {
            LoadStrategy::Cache(cache)
                if resolved.open_type == FsOpenType::Cache && cache.cache_decompress_file =>
            {
                Some(cache.clone())
            }
            _ => None,
        };
        // Decompressed blocks are cached already; the data file is read through
        let node_type = if decompress_cache.is_some() {
            FsOpenType::Buffered
        } else {
            resolved.open_type
        };
        let node = self.open_node(path, node_type)?;

        let load_meta = || -> Result<(CompressMeta, u64)> {
            let tail = if info.additional_flag(INFO_META_FILE) {
                self.read_whole(&compress_meta_path(path))?
            } else {
                let start = info.compress_file_len;
                let len = node.length().checked_sub(start).ok_or_else(|| {
                    Error::corruption(format!(
                        "{path}: {} bytes of data, info records {start}",
                        node.length()
                    ))
                })?;
                node.read_bytes(start, memory_len(path, len)?)?
            };
            let meta = CompressMeta::decode(&info, &tail)?;
            let memory = meta.memory_use();
            Ok((meta, memory))
        };
        let meta = if resolved.open_type == FsOpenType::Cache {
            self.get_or_create_resource(&compress_resource_path(path), load_meta)?
        } else {
            Arc::new(load_meta()?.0)
        };

        match decompress_cache {
            Some(cache) => {
                let block_size = usize::try_from(info.block_size)
                    .map_err(|_| Error::corruption(format!("{path}: block size overflow")))?;
                let block_cache = self.caches.get_or_create(
                    &format!("{}#decompress", resolved.scope),
                    cache.memory_size_bytes,
                    block_size,
                    cache.global_cache,
                )?;
                CompressFileReader::decompress_cached(
                    path,
                    node,
                    info,
                    meta,
                    block_cache,
                    cache.io_batch_size,
                )
            }
            None => CompressFileReader::new(path, node, info, meta),
        }
    }

    // ---------------------------------------------------------------
    // Resources and slices
    // ---------------------------------------------------------------

    /// Typed resource at `path`, built by `create` on first use
    ///
    /// `create` returns the value and the bytes it accounts for.
    pub fn get_or_create_resource<T: Any + Send + Sync>(
        &self,
        path: &str,
        create: impl FnOnce() -> Result<(T, u64)>,
    ) -> Result<Arc<T>> {
        let typed = |resource: &ResourceFile| {
            resource.get::<T>().ok_or_else(|| {
                Error::bad_parameter(format!("resource {path} holds another type"))
            })
        };
        if let Some(resource) = self.shared.resources.get(path) {
            return typed(&resource);
        }
        let (value, memory) = create()?;
        let resource = ResourceFile::new(path, value, memory, &self.shared.quota)?;
        let resource = Arc::clone(
            self.shared
                .resources
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(resource))
                .value(),
        );
        typed(&resource)
    }

    pub fn get_resource<T: Any + Send + Sync>(&self, path: &str) -> Option<Arc<T>> {
        self.shared.resources.get(path).and_then(|r| r.get::<T>())
    }

    /// Fixed-capacity in-memory file; never cached, lives until removed
    pub fn create_slice_file(
        &self,
        path: &str,
        slice_len: u64,
        slice_num: u64,
    ) -> Result<Arc<SliceFile>> {
        let path = normalize_path(path)?;
        let mut entries = self.shared.entries.write();
        if let Some(entry) = entries.get(&path) {
            if let PhysicalLocation::Slice(slice) = &entry.location {
                return Ok(Arc::clone(slice));
            }
            return Err(Error::AlreadyExists(path));
        }
        let slice = Arc::new(SliceFile::new(
            path.clone(),
            slice_len,
            slice_num,
            &self.shared.quota,
        )?);
        entries.insert(&path, Entry::file(PhysicalLocation::Slice(Arc::clone(&slice)), 0));
        Ok(slice)
    }

    // ---------------------------------------------------------------
    // Namespace
    // ---------------------------------------------------------------

    pub fn is_exist(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        Ok(self.shared.entries.read().exists(&path))
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        Ok(self.shared.entries.read().is_dir(&path))
    }

    /// Logical length; decompressed length for compressed files
    pub fn get_file_length(&self, path: &str) -> Result<u64> {
        let path = normalize_path(path)?;
        if let Some(info) = self.compress_info(&path)? {
            return Ok(info.decompress_file_len);
        }
        let entries = self.shared.entries.read();
        match entries.get(&path) {
            Some(entry) if entry.is_dir => {
                Err(Error::not_supported(format!("{path} is a directory")))
            }
            Some(Entry {
                location: PhysicalLocation::Slice(slice),
                ..
            }) => Ok(slice.length()),
            Some(entry) if entry.exists() => Ok(entry.length),
            _ => Err(Error::not_found(path)),
        }
    }

    /// Names below `dir`, relative to it, sorted
    pub fn list_dir(&self, dir: &str, recursive: bool) -> Result<Vec<String>> {
        let dir = normalize_path(dir)?;
        let entries = self.shared.entries.read();
        if !entries.is_dir(&dir) {
            return Err(Error::not_found(format!("directory {dir}")));
        }
        Ok(entries.list(&dir, recursive))
    }

    pub fn make_directory(&self, path: &str, option: DirectoryOption) -> Result<()> {
        let path = normalize_path(path)?;
        let mut packages = self.shared.packages.lock();
        {
            let entries = self.shared.entries.read();
            if entries.exists(&path) {
                if !entries.is_dir(&path) {
                    return Err(Error::AlreadyExists(format!("{path} is a file")));
                }
                if !option.recursive {
                    return Err(Error::AlreadyExists(path));
                }
            } else if !option.recursive && !entries.is_dir(parent_path(&path)) {
                return Err(Error::not_found(format!(
                    "parent of {path} does not exist"
                )));
            }
        }
        let enclosing = Self::package_dir_of(&packages, &path);
        if option.package && !packages.contains_key(&path) {
            self.register_package(&mut packages, &path)?;
        } else if let Some(dir) = enclosing {
            if let (Some(state), Some(rel)) = (packages.get_mut(&dir), relative_to(&dir, &path)) {
                state.add_dir(rel);
            }
        } else if matches!(self.shared.config.output_storage, OutputStorage::Disk) {
            let physical = self.physical_path(&path);
            fs::create_dir_all(&physical)
                .map_err(|e| Error::io(physical.to_string_lossy(), e))?;
        }
        self.shared.entries.write().add_dir(&path);
        Ok(())
    }

    /// Remove a file; package bytes are reclaimed by the next merge
    pub fn remove_file(&self, path: &str, option: RemoveOption) -> Result<()> {
        let path = normalize_path(path)?;
        let mut packages = self.shared.packages.lock();
        let removed = {
            let mut entries = self.shared.entries.write();
            match entries.get(&path) {
                Some(entry) if entry.is_dir => {
                    return Err(Error::not_supported(format!(
                        "{path} is a directory, use remove_directory"
                    )));
                }
                Some(_) => {}
                None if option.may_non_exist => return Ok(()),
                None => return Err(Error::not_found(path)),
            }
            let removed = entries.remove(&path);
            entries.remove(&compress_info_path(&path));
            entries.remove(&compress_meta_path(&path));
            removed
        };
        if let Some(dir) = Self::package_dir_of(&packages, &path) {
            if let (Some(state), Some(rel)) = (packages.get_mut(&dir), relative_to(&dir, &path)) {
                state.remove(rel);
                state.remove(&compress_info_path(rel));
                state.remove(&compress_meta_path(rel));
            }
        }
        drop(packages);

        self.forget(&path);
        self.shared.unflushed.lock().remove(&path);
        if let Some(entry) = removed {
            if let (PhysicalLocation::Disk { path: physical }, false) =
                (&entry.location, entry.read_only)
            {
                for file in [
                    physical.clone(),
                    PathBuf::from(compress_info_path(&physical.to_string_lossy())),
                    PathBuf::from(compress_meta_path(&physical.to_string_lossy())),
                ] {
                    remove_physical_file(&file)?;
                }
            }
        }
        FsCounters::inc(&self.shared.counters.files_removed, 1);
        debug!("Removed {}", path);
        Ok(())
    }

    /// Remove a directory and every logical file below it
    ///
    /// Package directories at or below it lose their physical package
    /// files, so a package re-created under the same name starts empty.
    pub fn remove_directory(&self, path: &str, option: RemoveOption) -> Result<()> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Err(Error::not_supported("cannot remove the root directory"));
        }
        let mut packages = self.shared.packages.lock();
        let removed = {
            let mut entries = self.shared.entries.write();
            match entries.get(&path) {
                Some(entry) if !entry.is_dir => {
                    return Err(Error::not_supported(format!(
                        "{path} is a file, use remove_file"
                    )));
                }
                Some(_) => {}
                None if option.may_non_exist => return Ok(()),
                None => return Err(Error::not_found(path)),
            }
            entries.remove_dir(&path)
        };

        let dropped: Vec<String> = packages
            .keys()
            .filter(|dir| is_sub_path(&path, dir))
            .cloned()
            .collect();
        for dir in dropped {
            if let Some(state) = packages.remove(&dir) {
                remove_package_files(state.dir())?;
            }
        }
        if let Some(dir) = Self::package_dir_of(&packages, &path) {
            if let (Some(state), Some(rel)) = (packages.get_mut(&dir), relative_to(&dir, &path)) {
                state.remove_prefix(rel);
            }
        }
        drop(packages);

        self.node_cache.remove_dir(&path);
        self.shared
            .resources
            .retain(|name, _| !is_sub_path(&path, name));
        self.shared
            .unflushed
            .lock()
            .retain(|name| !is_sub_path(&path, name));

        let mut read_only = false;
        for (_, entry) in &removed {
            read_only |= entry.read_only;
            if let (PhysicalLocation::Disk { path: physical }, false) =
                (&entry.location, entry.read_only)
            {
                remove_physical_file(physical)?;
            }
        }
        if !read_only {
            let physical = self.physical_path(&path);
            match fs::remove_dir_all(&physical) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(physical.to_string_lossy(), e)),
            }
        }
        FsCounters::inc(&self.shared.counters.files_removed, removed.len() as u64);
        info!("Removed directory {} ({} entries)", path, removed.len());
        Ok(())
    }

    /// Move a file; memory-resident sources land on disk at `dst`
    ///
    /// An existing destination is only accepted when it holds the same
    /// bytes, in which case the source is dropped.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let src = normalize_path(src)?;
        let dst = normalize_path(dst)?;
        if has_reserved_suffix(&dst) {
            return Err(Error::not_supported(format!(
                "{dst} ends with a reserved suffix"
            )));
        }
        {
            let packages = self.shared.packages.lock();
            if Self::package_dir_of(&packages, &src).is_some()
                || Self::package_dir_of(&packages, &dst).is_some()
            {
                return Err(Error::not_supported(format!(
                    "rename {src} -> {dst} inside a package directory"
                )));
            }
        }
        {
            let entries = self.shared.entries.read();
            match entries.get(&src) {
                Some(entry) if !entry.is_dir && entry.exists() => {}
                Some(_) => {
                    return Err(Error::not_supported(format!("rename of directory {src}")));
                }
                None => return Err(Error::not_found(src)),
            }
        }

        if self.shared.entries.read().exists(&dst) {
            let same = self.read_content(&dst)? == self.read_content(&src)?;
            self.forget(&dst);
            if !same {
                return Err(Error::AlreadyExists(format!(
                    "{dst} exists with different content"
                )));
            }
            debug!("Rename {} -> {}: destination identical, dropping source", src, dst);
            return self.remove_file(&src, RemoveOption::default());
        }

        let sidecar_names: [fn(&str) -> String; 2] = [compress_info_path, compress_meta_path];
        let resource = self
            .shared
            .resources
            .remove(&compress_resource_path(&src))
            .map(|(_, resource)| resource);
        self.move_entry(&src, &dst)?;
        for name in sidecar_names {
            let (src_sidecar, dst_sidecar) = (name(&src), name(&dst));
            let stale = self.shared.entries.write().remove(&dst_sidecar);
            if let Some(entry) = stale {
                if let (PhysicalLocation::Disk { path }, false) = (&entry.location, entry.read_only)
                {
                    remove_physical_file(path)?;
                }
            }
            if self.shared.entries.read().exists(&src_sidecar) {
                self.move_entry(&src_sidecar, &dst_sidecar)?;
            }
        }
        self.forget(&src);
        self.forget(&dst);
        if let Some(resource) = resource {
            self.shared
                .resources
                .insert(compress_resource_path(&dst), resource);
        }
        debug!("Renamed {} -> {}", src, dst);
        Ok(())
    }

    /// Move one entry to `dst`, writing mem data to disk
    fn move_entry(&self, src: &str, dst: &str) -> Result<()> {
        let Some((location, length, read_only)) = self
            .shared
            .entries
            .read()
            .get(src)
            .map(|e| (e.location.clone(), e.length, e.read_only))
        else {
            return Err(Error::not_found(src));
        };
        let target = self.physical_path(dst);
        let (new_location, read_only) = match location {
            PhysicalLocation::Mem { data } => {
                dump_file(&target, &data)?;
                (PhysicalLocation::Disk { path: target }, false)
            }
            PhysicalLocation::Disk { path } if !read_only => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| Error::io(parent.to_string_lossy(), e))?;
                }
                fs::rename(&path, &target).map_err(|e| Error::io(path.to_string_lossy(), e))?;
                (PhysicalLocation::Disk { path: target }, false)
            }
            other => (other, read_only),
        };
        {
            let mut entries = self.shared.entries.write();
            entries.remove(src);
            entries.insert(dst, Entry::file(new_location, length).read_only(read_only));
        }
        self.shared.unflushed.lock().remove(src);
        Ok(())
    }

    /// Logical content of a file, decompressed when compressed
    fn read_content(&self, path: &str) -> Result<Bytes> {
        self.create_file_reader(path, ReaderOption::new(FsOpenType::Mem))?
            .read_all()
    }

    // ---------------------------------------------------------------
    // Lifecycle and load control
    // ---------------------------------------------------------------

    pub fn set_dir_lifecycle(&self, dir: &str, lifecycle: Lifecycle) -> Result<()> {
        let dir = normalize_path(dir)?;
        self.shared.lifecycles.write().insert(dir, lifecycle);
        Ok(())
    }

    /// Lifecycle of the innermost tagged directory containing `path`
    pub fn get_file_lifecycle(&self, path: &str) -> Option<Lifecycle> {
        let lifecycles = self.shared.lifecycles.read();
        if lifecycles.is_empty() {
            return None;
        }
        lifecycles
            .get(path)
            .or_else(|| {
                let mut found = None;
                for dir in ancestors(path) {
                    found = lifecycles.get(dir).or(found);
                }
                found
            })
            .or_else(|| lifecycles.get(""))
            .cloned()
    }

    pub fn switch_load_speed_limit(&self, on: bool) {
        info!("Load speed limit {}", if on { "on" } else { "off" });
        self.shared.load_configs.switch_load_speed_limit(on);
    }

    // ---------------------------------------------------------------
    // Mounts
    // ---------------------------------------------------------------

    fn mount_entry(
        entries: &mut EntryTable,
        path: &str,
        entry: Entry,
        conflict: ConflictPolicy,
    ) -> Result<bool> {
        if let Some(existing) = entries.get(path) {
            match conflict {
                ConflictPolicy::Skip => return Ok(false),
                ConflictPolicy::CheckDiff
                    if !existing.is_dir
                        && !entry.is_dir
                        && !existing.location.same_as(&entry.location) =>
                {
                    return Err(Error::AlreadyExists(format!(
                        "{path} is already mounted from another location"
                    )));
                }
                _ if existing.is_dir && entry.is_dir => return Ok(false),
                _ => {}
            }
        }
        entries.insert(path, entry);
        Ok(true)
    }

    /// Mount a committed version of `physical_root` under `logical`
    ///
    /// `lifecycles` tags directories of the version, relative to its root.
    pub fn mount_version(
        &self,
        physical_root: &Path,
        version: u64,
        logical: &str,
        option: MountOption,
        lifecycles: &BTreeMap<String, Lifecycle>,
    ) -> Result<()> {
        let logical = normalize_path(logical)?;
        let table = match PersistedEntryTable::load(physical_root, version) {
            Ok(table) => table,
            Err(e) if e.is_not_found() && option.may_non_exist => {
                debug!(
                    "Version {} of {} absent, nothing mounted",
                    version,
                    physical_root.display()
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut mounted = 0usize;
        {
            let mut entries = self.shared.entries.write();
            entries.add_dir(&logical);
            for (path, entry) in table.resolve(physical_root, &logical) {
                if Self::mount_entry(&mut entries, &path, entry, option.conflict)? {
                    mounted += 1;
                }
            }
        }
        {
            let mut tags = self.shared.lifecycles.write();
            for (dir, lifecycle) in lifecycles {
                tags.insert(join_path(&logical, dir), lifecycle.clone());
            }
        }
        self.node_cache.remove_dir(&logical);
        info!(
            "Mounted version {} of {} at /{} ({} entries)",
            version,
            physical_root.display(),
            logical,
            mounted
        );
        Ok(())
    }

    /// Mount every file below a physical directory
    pub fn mount_dir(&self, physical: &Path, logical: &str, option: MountOption) -> Result<()> {
        let logical = normalize_path(logical)?;
        if !physical.is_dir() {
            if option.may_non_exist {
                let mut entries = self.shared.entries.write();
                Self::mount_entry(
                    &mut entries,
                    &logical,
                    Entry::file(PhysicalLocation::Missing, 0).read_only(true),
                    ConflictPolicy::Skip,
                )?;
                return Ok(());
            }
            return Err(Error::not_found(format!(
                "directory {}",
                physical.display()
            )));
        }
        let mut found = Vec::new();
        collect_physical(physical, &logical, &mut found)?;
        let mut entries = self.shared.entries.write();
        entries.add_dir(&logical);
        for (path, entry) in found {
            Self::mount_entry(&mut entries, &path, entry, option.conflict)?;
        }
        drop(entries);
        self.node_cache.remove_dir(&logical);
        debug!("Mounted {} at /{}", physical.display(), logical);
        Ok(())
    }

    pub fn mount_file(&self, physical: &Path, logical: &str, option: MountOption) -> Result<()> {
        let logical = normalize_path(logical)?;
        let entry = match fs::metadata(physical) {
            Ok(meta) if meta.is_file() => Entry::file(
                PhysicalLocation::Disk {
                    path: physical.to_path_buf(),
                },
                meta.len(),
            ),
            Ok(_) => {
                return Err(Error::not_supported(format!(
                    "{} is not a file",
                    physical.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && option.may_non_exist => {
                Entry::file(PhysicalLocation::Missing, 0)
            }
            Err(e) => return Err(Error::io(physical.to_string_lossy(), e)),
        };
        let mut entries = self.shared.entries.write();
        Self::mount_entry(&mut entries, &logical, entry.read_only(true), option.conflict)?;
        drop(entries);
        self.forget(&logical);
        Ok(())
    }

    /// Read-only snapshot of the flushed files below `dir`
    ///
    /// Returns the logical path of the link. Files still in memory are not
    /// part of the snapshot; later changes below `dir` do not affect it.
    pub fn create_root_link(&self, dir: &str) -> Result<String> {
        let dir = normalize_path(dir)?;
        let link = join_path(ROOT_LINK_NAME, &dir);
        let mut entries = self.shared.entries.write();
        if !entries.is_dir(&dir) {
            return Err(Error::not_found(format!("directory {dir}")));
        }
        let snapshot: Vec<(String, Entry)> = entries
            .under(&dir)
            .filter_map(|(path, entry)| {
                let rel = relative_to(&dir, path)?;
                let linked = match &entry.location {
                    _ if entry.is_dir => Entry::dir(),
                    location @ (PhysicalLocation::Disk { .. }
                    | PhysicalLocation::Package { .. }) => {
                        Entry::file(location.clone(), entry.length)
                    }
                    _ => return None,
                };
                Some((join_path(&link, rel), linked.read_only(true)))
            })
            .collect();
        entries.remove_dir(&link);
        entries.add_dir(&link);
        for (path, entry) in snapshot {
            entries.insert(&path, entry);
        }
        drop(entries);
        self.node_cache.remove_dir(&link);
        Ok(link)
    }

    // ---------------------------------------------------------------
    // Durability
    // ---------------------------------------------------------------

    /// Dump in-memory files to disk
    ///
    /// With async flush the dumps run on the flush worker and the returned
    /// future resolves when they are done; `wait_finish` blocks for it.
    pub fn sync(&self, wait_finish: bool) -> Result<SyncFuture> {
        FsCounters::inc(&self.shared.counters.syncs, 1);
        if !self.shared.config.need_flush {
            return Ok(SyncFuture::ready(Ok(())));
        }
        let paths = std::mem::take(&mut *self.shared.unflushed.lock());
        let mut tasks = Vec::with_capacity(paths.len());
        {
            let entries = self.shared.entries.read();
            for path in paths {
                if let Some(Entry {
                    location: PhysicalLocation::Mem { data },
                    ..
                }) = entries.get(&path)
                {
                    tasks.push((path, data.clone()));
                }
            }
        }
        debug!("Sync of {}: {} files to dump", self.name(), tasks.len());

        // With copy_on_dump the flush writes a private snapshot of the buffer
        let copy = self.shared.config.copy_on_dump;
        let tasks: Vec<(String, Bytes, Bytes)> = tasks
            .into_iter()
            .map(|(path, data)| {
                let payload = if copy {
                    Bytes::copy_from_slice(&data)
                } else {
                    data.clone()
                };
                (path, data, payload)
            })
            .collect();

        match &self.shared.flush {
            Some(queue) => {
                for (path, data, payload) in tasks {
                    let shared = Arc::clone(&self.shared);
                    queue.submit(Box::new(move || {
                        let result = shared.dump_mem_file(&path, &data, &payload);
                        if result.is_err() {
                            shared.unflushed.lock().insert(path);
                        }
                        result
                    }))?;
                }
                let future = queue.barrier();
                if wait_finish {
                    future.wait()?;
                    return Ok(SyncFuture::ready(Ok(())));
                }
                Ok(future)
            }
            None => {
                let mut result = Ok(());
                for (path, data, payload) in tasks {
                    if let Err(e) = self.shared.dump_mem_file(&path, &data, &payload) {
                        warn!("Failed to dump {}: {}", path, e);
                        self.shared.unflushed.lock().insert(path);
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
                Ok(SyncFuture::ready(result))
            }
        }
    }

    /// Drop materialized nodes and cached blocks; durable data is untouched
    pub fn clean_cache(&self) {
        self.node_cache.clear();
        self.caches.clear();
        debug!("Cleaned caches of {}", self.name());
    }

    /// Flush one package directory at the current checkpoint
    pub fn flush_package(&self, dir: &str) -> Result<()> {
        let dir = normalize_path(dir)?;
        let checkpoint = self.shared.checkpoint.load(Ordering::Acquire);
        let mut packages = self.shared.packages.lock();
        let state = packages
            .get_mut(&dir)
            .ok_or_else(|| Error::not_found(format!("package directory {dir}")))?;
        let packed = state.flush(checkpoint)?;
        self.shared.apply_packed(&dir, packed);
        Ok(())
    }

    /// Flush every package and return the new checkpoint
    pub fn commit_package(&self) -> Result<u64> {
        let mut packages = self.shared.packages.lock();
        let checkpoint = self.shared.checkpoint.fetch_add(1, Ordering::AcqRel) + 1;
        for (dir, state) in packages.iter_mut() {
            let packed = state.flush(checkpoint)?;
            self.shared.apply_packed(dir, packed);
        }
        info!(
            "Committed {} package directories at checkpoint {}",
            packages.len(),
            checkpoint
        );
        Ok(checkpoint)
    }

    /// Compact the shards of a package directory
    pub fn merge_package_files(&self, dir: &str) -> Result<()> {
        let dir = normalize_path(dir)?;
        let checkpoint = self.shared.checkpoint.load(Ordering::Acquire);
        let mut packages = self.shared.packages.lock();
        let state = packages
            .get_mut(&dir)
            .ok_or_else(|| Error::not_found(format!("package directory {dir}")))?;
        let packed = state.merge(checkpoint)?;
        self.shared.apply_packed(&dir, packed);
        drop(packages);
        self.node_cache.remove_dir(&dir);
        Ok(())
    }

    /// Restore a package directory to `checkpoint` after a crash
    ///
    /// `files` lists the physical files found in the directory.
    pub fn recover_package(&self, checkpoint: u64, dir: &str, files: &[String]) -> Result<()> {
        let dir = normalize_path(dir)?;
        let state = PackageState::recover(self.physical_path(&dir), checkpoint, files)?;
        let mut packages = self.shared.packages.lock();
        {
            let mut entries = self.shared.entries.write();
            entries.remove_dir(&dir);
            entries.add_dir(&dir);
            for sub in state.dirs() {
                entries.add_dir(&join_path(&dir, sub));
            }
        }
        let packed: Vec<PackedEntry> = state.packed_entries().collect();
        self.shared.apply_packed(&dir, packed);
        packages.insert(dir.clone(), state);
        self.shared
            .checkpoint
            .fetch_max(checkpoint, Ordering::AcqRel);
        drop(packages);
        self.node_cache.remove_dir(&dir);
        Ok(())
    }

    /// Persist a version: the selected files and directories plus a final marker
    ///
    /// In-memory files are synced and packages committed first. With a
    /// fence the commit fails with `Fenced` once another attempt took over.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_selected_files_and_dir(
        &self,
        version: u64,
        files: &[String],
        dirs: &[String],
        filter_dirs: &[String],
        final_dump_file_name: &str,
        final_dump_file_content: &[u8],
        fence: Option<&FenceContext>,
    ) -> Result<()> {
        if let Some(fence) = fence {
            fence.validate()?;
        }
        self.sync(true)?.wait()?;
        self.commit_package()?;

        let normalize_all = |paths: &[String]| -> Result<Vec<String>> {
            paths.iter().map(|p| normalize_path(p)).collect()
        };
        let mut files = normalize_all(files)?;
        let dirs = normalize_all(dirs)?;
        let filter_dirs = normalize_all(filter_dirs)?;
        let final_name = normalize_path(final_dump_file_name)?;

        // The fence is checked again right before anything becomes visible
        if let Some(fence) = fence {
            fence.validate()?;
        }
        let final_path = self.physical_path(&final_name);
        dump_file(&final_path, final_dump_file_content)?;
        self.shared.entries.write().insert(
            &final_name,
            Entry::file(
                PhysicalLocation::Disk { path: final_path },
                final_dump_file_content.len() as u64,
            ),
        );
        self.forget(&final_name);
        files.push(final_name);

        let table = self
            .shared
            .entries
            .read()
            .persist(&self.shared.root, &files, &dirs, &filter_dirs)?;
        table.store(&self.shared.root, version)?;
        info!(
            "Committed version {} of {}: {} files, {} directories",
            version,
            self.name(),
            table.files.len(),
            table.dirs.len()
        );
        Ok(())
    }

    // ---------------------------------------------------------------
    // Metrics
    // ---------------------------------------------------------------

    pub fn metrics(&self) -> FileSystemMetrics {
        let mut metrics = FileSystemMetrics::default();
        {
            let entries = self.shared.entries.read();
            for (_, entry) in entries.under("") {
                if entry.is_dir {
                    metrics.dir_count += 1;
                } else if entry.exists() {
                    metrics.file_count += 1;
                    if let PhysicalLocation::Mem { data } = &entry.location {
                        metrics.mem_file_bytes += data.len() as u64;
                    }
                }
            }
        }
        let stats = self.node_cache.stats();
        metrics.node_cache_nodes = self.node_cache.len() as u64;
        metrics.node_cache_hits = stats.hits.load(Ordering::Relaxed);
        metrics.node_cache_misses = stats.misses.load(Ordering::Relaxed);
        metrics.node_cache_replaces = stats.replaces.load(Ordering::Relaxed);
        metrics.node_memory_use = self.node_cache.memory_use();

        let (hits, misses) = self.caches.stats();
        metrics.block_cache_hits = hits;
        metrics.block_cache_misses = misses;
        metrics.block_cache_memory_use = self.caches.memory_use();

        metrics.resource_count = self.shared.resources.len() as u64;
        metrics.resource_memory_use = self
            .shared
            .resources
            .iter()
            .map(|r| r.memory_use())
            .sum();
        metrics.quota_used = self.shared.quota.used();
        metrics.quota_limit = self.shared.quota.limit();
        {
            let packages = self.shared.packages.lock();
            metrics.package_dirs = packages.len() as u64;
            metrics.staged_package_files =
                packages.values().map(|p| p.staged_len() as u64).sum();
        }
        metrics.pending_flush_tasks = self.shared.flush.as_ref().map_or(0, FlushQueue::pending);
        metrics.with_counters(&self.shared.counters)
    }
}

fn memory_len(path: &str, len: u64) -> Result<usize> {
    usize::try_from(len)
        .map_err(|_| Error::bad_parameter(format!("{path}: {len} bytes do not fit in memory")))
}

fn remove_physical_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path.to_string_lossy(), e)),
    }
}

/// Entries of every file below a physical directory
fn collect_physical(physical: &Path, logical: &str, out: &mut Vec<(String, Entry)>) -> Result<()> {
    if physical.join(PACKAGE_META_FILE).is_file() {
        let state = PackageState::open(physical)?;
        for sub in state.dirs() {
            out.push((join_path(logical, sub), Entry::dir().read_only(true)));
        }
        for packed in state.packed_entries() {
            let length = packed.length;
            out.push((
                join_path(logical, &packed.name),
                Entry::file(
                    PhysicalLocation::Package {
                        data_path: packed.data_path,
                        offset: packed.offset,
                        length,
                    },
                    length,
                )
                .read_only(true),
            ));
        }
    }
    let listing = fs::read_dir(physical).map_err(|e| Error::io(physical.to_string_lossy(), e))?;
    for item in listing {
        let item = item.map_err(|e| Error::io(physical.to_string_lossy(), e))?;
        let name = item.file_name().to_string_lossy().into_owned();
        if is_package_file(&name) || name.contains(TEMP_FILE_MARKER) {
            continue;
        }
        let path = join_path(logical, &name);
        let meta = item
            .metadata()
            .map_err(|e| Error::io(item.path().to_string_lossy(), e))?;
        if meta.is_dir() {
            out.push((path.clone(), Entry::dir().read_only(true)));
            collect_physical(&item.path(), &path, out)?;
        } else {
            out.push((
                path,
                Entry::file(PhysicalLocation::Disk { path: item.path() }, meta.len())
                    .read_only(true),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::package_data_file;
    use crate::storage::package::PackageMeta;
    use indexfs_common::ErrorKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn new_fs(root: &Path, config: FileSystemConfig) -> LogicalFileSystem {
        LogicalFileSystem::create("test", root, FileSystemOptions::new(config, LoadConfigList::new()))
            .unwrap()
    }

    fn write(fs: &LogicalFileSystem, path: &str, data: &[u8], option: &WriterOption) {
        let mut writer = fs.create_file_writer(path, option).unwrap();
        writer.write(data).unwrap();
        writer.close().unwrap();
    }

    fn payload(seed: u64, len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(0..=255u8)).collect()
    }

    fn read(fs: &LogicalFileSystem, path: &str, open_type: FsOpenType) -> Bytes {
        fs.create_file_reader(path, ReaderOption::new(open_type))
            .unwrap()
            .read_all()
            .unwrap()
    }

    #[test]
    fn test_every_open_type_reads_the_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        let data = payload(1, 10_000);
        write(&fs, "seg/data", &data, &WriterOption::new());
        assert!(dir.path().join("seg/data").is_file());

        for open_type in [
            FsOpenType::Mem,
            FsOpenType::Mmap,
            FsOpenType::Cache,
            FsOpenType::Buffered,
            FsOpenType::LoadConfig,
        ] {
            let reader = fs
                .create_file_reader("seg/data", ReaderOption::new(open_type))
                .unwrap();
            assert_eq!(reader.length(), 10_000);
            assert_eq!(reader.read_bytes(100, 5000).unwrap(), &data[100..5100]);
        }
        assert!(matches!(
            fs.create_file_reader("seg/missing", ReaderOption::load_config()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_node_cache_shares_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        write(&fs, "f", &payload(2, 512), &WriterOption::new());

        let a = fs.open_node("f", FsOpenType::Mmap).unwrap();
        let b = fs.open_node("f", FsOpenType::Mmap).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = fs.open_node("f", FsOpenType::Cache).unwrap();
        assert_eq!(c.file_type(), FsFileType::Block);
        let metrics = fs.metrics();
        assert_eq!(metrics.node_cache_misses, 1);
        assert_eq!(metrics.node_cache_hits, 1);
        assert_eq!(metrics.node_cache_replaces, 1);

        // Replaced nodes stay readable for their holders
        assert_eq!(a.read_bytes(0, 512).unwrap(), c.read_bytes(0, 512).unwrap());

        fs.clean_cache();
        assert_eq!(fs.node_cache().len(), 0);
        assert!(fs.is_exist("f").unwrap());
    }

    #[test]
    fn test_remove_is_idempotent_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        write(&fs, "a/b/c", b"c", &WriterOption::new());
        write(&fs, "a/d", b"d", &WriterOption::new());
        write(&fs, "e", b"e", &WriterOption::new());

        fs.remove_file("e", RemoveOption::default()).unwrap();
        fs.remove_file("e", RemoveOption::may_non_exist()).unwrap();
        assert!(matches!(
            fs.remove_file("e", RemoveOption::default()),
            Err(Error::NotFound(_))
        ));
        assert!(!dir.path().join("e").exists());
        assert_eq!(
            fs.remove_file("a", RemoveOption::default()).unwrap_err().kind(),
            ErrorKind::NotSupported
        );

        assert_eq!(fs.list_dir("a", true).unwrap(), vec!["b", "b/c", "d"]);
        fs.remove_directory("a", RemoveOption::default()).unwrap();
        assert!(!fs.is_exist("a").unwrap());
        assert!(fs.list_dir("", true).unwrap().is_empty());
        assert!(!dir.path().join("a").exists());
        fs.remove_directory("a", RemoveOption::may_non_exist()).unwrap();
    }

    #[test]
    fn test_package_recreated_without_residue() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        fs.make_directory("pkg", DirectoryOption::package()).unwrap();
        write(&fs, "pkg/a", b"first", &WriterOption::new());
        write(&fs, "pkg/sub/b", b"second", &WriterOption::new());

        // Staged files are readable before the commit
        assert_eq!(read(&fs, "pkg/a", FsOpenType::Mem), &b"first"[..]);
        assert_eq!(fs.metrics().staged_package_files, 2);
        let checkpoint = fs.commit_package().unwrap();
        assert_eq!(checkpoint, 1);
        assert_eq!(fs.metrics().staged_package_files, 0);
        assert_eq!(read(&fs, "pkg/sub/b", FsOpenType::Mmap), &b"second"[..]);
        assert_eq!(read(&fs, "pkg/a", FsOpenType::Cache), &b"first"[..]);

        fs.remove_directory("pkg", RemoveOption::default()).unwrap();
        assert!(!fs.is_exist("pkg/a").unwrap());

        fs.make_directory("pkg", DirectoryOption::package()).unwrap();
        write(&fs, "pkg/c", b"third", &WriterOption::new());
        fs.commit_package().unwrap();
        assert_eq!(fs.list_dir("pkg", true).unwrap(), vec!["c"]);
        let meta = PackageMeta::load(&dir.path().join("pkg")).unwrap();
        assert_eq!(meta.files.keys().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(read(&fs, "pkg/c", FsOpenType::Mem), &b"third"[..]);
    }

    #[test]
    fn test_rename_dumps_mem_and_rejects_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::in_memory());
        write(&fs, "a", b"payload", &WriterOption::new());
        assert!(!dir.path().join("a").exists());

        fs.rename("a", "b").unwrap();
        assert!(!fs.is_exist("a").unwrap());
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"payload");

        write(&fs, "c", b"other", &WriterOption::new());
        assert!(matches!(fs.rename("c", "b"), Err(Error::AlreadyExists(_))));
        assert!(fs.is_exist("c").unwrap());

        write(&fs, "d", b"payload", &WriterOption::new());
        fs.rename("d", "b").unwrap();
        assert!(!fs.is_exist("d").unwrap());
        assert_eq!(read(&fs, "b", FsOpenType::Mem), &b"payload"[..]);
    }

    fn compressible(seed: u64, len: usize) -> Vec<u8> {
        let pattern = payload(seed, 61);
        pattern.iter().copied().cycle().take(len).collect()
    }

    #[test]
    fn test_rename_moves_compress_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        let data = compressible(11, 20_000);
        let mut option = WriterOption::compress("lz4", 1024);
        option
            .compressor_params
            .insert("enable_meta_file".to_string(), "true".to_string());
        write(&fs, "seg/a", &data, &option);
        assert_eq!(read(&fs, "seg/a", FsOpenType::Cache), &data[..]);
        assert_eq!(fs.metrics().resource_count, 1);

        fs.rename("seg/a", "seg/b").unwrap();
        for gone in [
            "seg/a".to_string(),
            compress_info_path("seg/a"),
            compress_meta_path("seg/a"),
        ] {
            assert!(!fs.is_exist(&gone).unwrap());
            assert!(!dir.path().join(&gone).exists());
        }
        assert!(dir.path().join(compress_info_path("seg/b")).is_file());
        assert!(dir.path().join(compress_meta_path("seg/b")).is_file());
        assert_eq!(fs.get_file_length("seg/b").unwrap(), 20_000);
        assert_eq!(
            fs.compress_info("seg/b").unwrap().unwrap().decompress_file_len,
            20_000
        );
        assert!(fs
            .get_resource::<CompressMeta>(&compress_resource_path("seg/a"))
            .is_none());
        assert_eq!(read(&fs, "seg/b", FsOpenType::Cache), &data[..]);
        assert_eq!(read(&fs, "seg/b", FsOpenType::Mem), &data[..]);
        assert_eq!(fs.metrics().resource_count, 1);

        fs.remove_file("seg/b", RemoveOption::default()).unwrap();
        assert!(!dir.path().join(compress_info_path("seg/b")).exists());
    }

    #[test]
    fn test_rename_compares_decompressed_content() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::in_memory());
        let data = compressible(12, 9_000);
        let lz4 = WriterOption::compress("lz4", 512);
        write(&fs, "packed", &data, &lz4);
        write(&fs, "plain", &data, &WriterOption::new());

        // Same logical bytes, different stored bytes
        fs.rename("plain", "packed").unwrap();
        assert!(!fs.is_exist("plain").unwrap());
        assert_eq!(read(&fs, "packed", FsOpenType::Mem), &data[..]);

        let mut other = data.clone();
        other[100] ^= 0xff;
        write(&fs, "different", &other, &lz4);
        assert!(matches!(
            fs.rename("different", "packed"),
            Err(Error::AlreadyExists(_))
        ));
        assert!(fs.is_exist(&compress_info_path("different")).unwrap());

        // A mem compressed file moves to disk with its info
        fs.rename("packed", "moved").unwrap();
        assert!(dir.path().join("moved").is_file());
        assert!(dir.path().join(compress_info_path("moved")).is_file());
        assert!(!fs.is_exist(&compress_info_path("packed")).unwrap());
        assert_eq!(fs.get_file_length("moved").unwrap(), 9_000);
        assert_eq!(read(&fs, "moved", FsOpenType::Mmap), &data[..]);
    }

    #[test]
    fn test_plain_rewrite_drops_compress_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        let data = compressible(13, 20_000);
        let mut with_meta = WriterOption::compress("lz4", 1024);
        with_meta
            .compressor_params
            .insert("enable_meta_file".to_string(), "true".to_string());
        write(&fs, "a", &data, &with_meta);
        assert_eq!(read(&fs, "a", FsOpenType::Mem), &data[..]);

        write(&fs, "a", b"plain bytes", &WriterOption::new());
        assert_eq!(fs.get_file_length("a").unwrap(), 11);
        assert!(fs.compress_info("a").unwrap().is_none());
        assert_eq!(read(&fs, "a", FsOpenType::Mem), &b"plain bytes"[..]);
        assert_eq!(read(&fs, "a", FsOpenType::Cache), &b"plain bytes"[..]);
        for sidecar in [compress_info_path("a"), compress_meta_path("a")] {
            assert!(!fs.is_exist(&sidecar).unwrap());
            assert!(!dir.path().join(&sidecar).exists());
        }

        // Compressed again without a meta file: the old meta is not kept
        write(&fs, "a", &data, &with_meta);
        write(&fs, "a", &data, &WriterOption::compress("lz4", 2048));
        assert!(!fs.is_exist(&compress_meta_path("a")).unwrap());
        assert_eq!(fs.compress_info("a").unwrap().unwrap().block_size, 2048);
        assert_eq!(read(&fs, "a", FsOpenType::Mem), &data[..]);
    }

    #[test]
    fn test_commit_then_mount_version() {
        let build = tempfile::tempdir().unwrap();
        let fs = new_fs(build.path(), FileSystemConfig::in_memory());
        let data = payload(3, 3000);
        write(&fs, "segment_0_level_0/data", &data, &WriterOption::new());
        write(&fs, "segment_0_level_0/tmp/scratch", b"x", &WriterOption::new());
        fs.make_directory("segment_0_level_0/empty", DirectoryOption::recursive())
            .unwrap();
        fs.commit_selected_files_and_dir(
            1,
            &[],
            &["segment_0_level_0".to_string()],
            &["segment_0_level_0/tmp".to_string()],
            "version.1",
            br#"{"versionid":1}"#,
            None,
        )
        .unwrap();
        assert!(build.path().join("segment_0_level_0/data").is_file());

        let online = tempfile::tempdir().unwrap();
        let reader_fs = new_fs(online.path(), FileSystemConfig::default());
        reader_fs
            .mount_version(build.path(), 1, "index", MountOption::default(), &BTreeMap::new())
            .unwrap();
        assert_eq!(
            read(&reader_fs, "index/segment_0_level_0/data", FsOpenType::Cache),
            &data[..]
        );
        assert_eq!(
            read(&reader_fs, "index/version.1", FsOpenType::Mem),
            &br#"{"versionid":1}"#[..]
        );
        assert!(reader_fs.is_dir("index/segment_0_level_0/empty").unwrap());
        assert!(!reader_fs.is_exist("index/segment_0_level_0/tmp/scratch").unwrap());

        // Mounted files belong to the version; removal keeps the bytes
        reader_fs
            .remove_directory("index", RemoveOption::default())
            .unwrap();
        assert!(build.path().join("segment_0_level_0/data").is_file());

        let missing = reader_fs.mount_version(
            build.path(),
            7,
            "index",
            MountOption::default(),
            &BTreeMap::new(),
        );
        assert!(matches!(missing, Err(Error::NotFound(_))));
        reader_fs
            .mount_version(
                build.path(),
                7,
                "index",
                MountOption::default().may_non_exist(),
                &BTreeMap::new(),
            )
            .unwrap();
    }

    #[test]
    fn test_mount_conflicts() {
        let build = tempfile::tempdir().unwrap();
        let fs = new_fs(build.path(), FileSystemConfig::default());
        write(&fs, "f", b"built", &WriterOption::new());
        fs.commit_selected_files_and_dir(1, &["f".to_string()], &[], &[], "version.1", b"{}", None)
            .unwrap();

        let online = tempfile::tempdir().unwrap();
        let reader_fs = new_fs(online.path(), FileSystemConfig::default());
        write(&reader_fs, "f", b"local", &WriterOption::new());
        let err = reader_fs.mount_version(
            build.path(),
            1,
            "",
            MountOption::new(ConflictPolicy::CheckDiff),
            &BTreeMap::new(),
        );
        assert!(matches!(err, Err(Error::AlreadyExists(_))));

        reader_fs
            .mount_version(build.path(), 1, "", MountOption::new(ConflictPolicy::Skip), &BTreeMap::new())
            .unwrap();
        assert_eq!(read(&reader_fs, "f", FsOpenType::Mem), &b"local"[..]);
        reader_fs
            .mount_version(build.path(), 1, "", MountOption::default(), &BTreeMap::new())
            .unwrap();
        assert_eq!(read(&reader_fs, "f", FsOpenType::Mem), &b"built"[..]);
    }

    #[test]
    fn test_stale_fence_cannot_commit() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        write(&fs, "f", b"data", &WriterOption::new());

        let first = FenceContext::acquire(dir.path()).unwrap();
        let retry = FenceContext::acquire(dir.path()).unwrap();
        let files = ["f".to_string()];
        let err = fs
            .commit_selected_files_and_dir(1, &files, &[], &[], "version.1", b"{}", Some(&first))
            .unwrap_err();
        assert!(matches!(err, Error::Fenced { .. }));
        assert!(!dir.path().join("version.1").exists());

        fs.commit_selected_files_and_dir(1, &files, &[], &[], "version.1", b"{}", Some(&retry))
            .unwrap();
        assert!(dir.path().join("version.1").is_file());
    }

    #[test]
    fn test_compressed_file_through_file_system() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 97) as u8).collect();
        let option = WriterOption::compress("lz4", 1024);
        let mut writer = fs.create_file_writer("attr", &option).unwrap();
        writer.write(&data).unwrap();
        writer.close().unwrap();
        assert_eq!(writer.logic_length(), 20_000);
        assert!(writer.length() < 20_000);

        assert!(fs.is_exist(&compress_info_path("attr")).unwrap());
        assert_eq!(fs.get_file_length("attr").unwrap(), 20_000);
        assert_eq!(fs.compress_info("attr").unwrap().unwrap().block_count, 20);

        let reader = fs
            .create_file_reader("attr", ReaderOption::new(FsOpenType::Cache))
            .unwrap();
        assert!(reader.is_compressed());
        assert_eq!(reader.read_all().unwrap(), &data[..]);
        assert!(fs
            .get_resource::<CompressMeta>(&compress_resource_path("attr"))
            .is_some());
        assert_eq!(fs.metrics().resource_count, 1);

        let raw = fs
            .create_file_reader("attr", ReaderOption::no_compress(FsOpenType::Mem))
            .unwrap();
        assert!(!raw.is_compressed());
        assert!(raw.length() < 20_000);

        fs.remove_file("attr", RemoveOption::default()).unwrap();
        assert!(!fs.is_exist(&compress_info_path("attr")).unwrap());
        assert_eq!(fs.metrics().resource_count, 0);
    }

    #[test]
    fn test_decompress_cached_through_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let load_configs = LoadConfigList::from_json(
            r#"{"load_config":[{"file_patterns":["attr"],"load_strategy":"cache",
                "load_strategy_param":{"cache_size":4,"cache_decompress_file":true}}]}"#,
        )
        .unwrap();
        let fs = LogicalFileSystem::create(
            "test",
            dir.path(),
            FileSystemOptions::new(FileSystemConfig::default(), load_configs),
        )
        .unwrap();
        let data = payload(4, 9000);
        write(&fs, "attr", &data, &WriterOption::compress("zstd", 2048));

        let reader = fs.create_file_reader("attr", ReaderOption::load_config()).unwrap();
        assert!(reader.compress_reader().unwrap().is_decompress_cached());
        assert_eq!(reader.read_bytes(4000, 3000).unwrap(), &data[4000..7000]);
        assert_eq!(reader.read_bytes(4000, 3000).unwrap(), &data[4000..7000]);
        assert!(fs.metrics().block_cache_hits > 0);
    }

    #[test]
    fn test_reserved_suffix_writer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        for path in [
            "x.__compress_info__",
            "x.__compress_meta__",
            "x.compress_resource_mmap",
        ] {
            let err = fs.create_file_writer(path, &WriterOption::new()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotSupported, "{path}");
        }
    }

    #[test]
    fn test_async_sync_moves_mem_files_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileSystemConfig {
            enable_async_flush: true,
            copy_on_dump: true,
            ..FileSystemConfig::in_memory()
        };
        let fs = new_fs(dir.path(), config);
        for i in 0..5 {
            write(&fs, &format!("seg/{i}"), &payload(i, 100), &WriterOption::new());
        }
        assert!(fs.metrics().mem_file_bytes > 0);
        assert!(!dir.path().join("seg/0").exists());

        fs.sync(false).unwrap().wait().unwrap();
        for i in 0..5 {
            assert_eq!(
                std::fs::read(dir.path().join(format!("seg/{i}"))).unwrap(),
                payload(i, 100)
            );
        }
        let metrics = fs.metrics();
        assert_eq!(metrics.flushed_files, 5);
        assert_eq!(metrics.mem_file_bytes, 0);
        assert_eq!(metrics.pending_flush_tasks, 0);
        assert_eq!(read(&fs, "seg/3", FsOpenType::Mmap), payload(3, 100));
    }

    #[test]
    fn test_recover_package_drops_dirty_files() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = {
            let fs = new_fs(dir.path(), FileSystemConfig::default());
            fs.make_directory("pkg", DirectoryOption::package()).unwrap();
            write(&fs, "pkg/a", b"kept", &WriterOption::new());
            fs.commit_package().unwrap()
        };
        let pkg = dir.path().join("pkg");
        std::fs::write(pkg.join(package_data_file(9)), b"half written").unwrap();
        let files: Vec<String> = std::fs::read_dir(&pkg)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();

        let fs = new_fs(dir.path(), FileSystemConfig::default());
        fs.recover_package(checkpoint, "pkg", &files).unwrap();
        assert!(!pkg.join(package_data_file(9)).exists());
        assert_eq!(fs.list_dir("pkg", false).unwrap(), vec!["a"]);
        assert_eq!(read(&fs, "pkg/a", FsOpenType::Mem), &b"kept"[..]);

        // Writes continue in the recovered package
        write(&fs, "pkg/b", b"new", &WriterOption::new());
        assert!(fs.commit_package().unwrap() > checkpoint);
        assert_eq!(fs.list_dir("pkg", false).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_thread_own_file_system() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        let own = fs.create_thread_own_file_system("worker-1");
        assert_eq!(own.session(), Some("worker-1"));

        write(&own, "f", b"shared", &WriterOption::new());
        assert!(fs.is_exist("f").unwrap());
        let a = fs.open_node("f", FsOpenType::Cache).unwrap();
        let b = own.open_node("f", FsOpenType::Cache).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(fs.node_cache().len(), 1);
        assert_eq!(own.node_cache().len(), 1);
        assert_eq!(b.read_bytes(0, 6).unwrap(), &b"shared"[..]);
    }

    #[test]
    fn test_lifecycle_selects_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let load_configs = LoadConfigList::from_json(
            r#"{"load_config":[{"name":"cold","file_patterns":[".*"],"load_strategy":"cache",
                "load_strategy_param":{"cache_size":1},"lifecycle":"cold"}]}"#,
        )
        .unwrap();
        let fs = LogicalFileSystem::create(
            "test",
            dir.path(),
            FileSystemOptions::new(FileSystemConfig::default(), load_configs),
        )
        .unwrap();
        write(&fs, "old/f", b"cold bytes", &WriterOption::new());
        write(&fs, "new/f", b"hot bytes", &WriterOption::new());
        fs.set_dir_lifecycle("old", Lifecycle::cold()).unwrap();
        assert_eq!(fs.get_file_lifecycle("old/f"), Some(Lifecycle::cold()));
        assert_eq!(fs.get_file_lifecycle("new/f"), None);

        let cold = fs.create_file_reader("old/f", ReaderOption::load_config()).unwrap();
        let hot = fs.create_file_reader("new/f", ReaderOption::load_config()).unwrap();
        assert_eq!(cold.file_type(), Some(FsFileType::Block));
        assert_eq!(hot.file_type(), Some(FsFileType::Mmap));
    }

    #[test]
    fn test_slice_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        let slice = fs.create_slice_file("s", 16, 4).unwrap();
        slice.append(b"hello").unwrap();
        assert!(Arc::ptr_eq(&slice, &fs.create_slice_file("s", 16, 4).unwrap()));
        assert_eq!(fs.get_file_length("s").unwrap(), 5);
        assert_eq!(fs.metrics().quota_used, 64);

        let reader = fs.create_file_reader("s", ReaderOption::new(FsOpenType::Slice)).unwrap();
        assert_eq!(reader.file_type(), Some(FsFileType::Slice));
        assert_eq!(reader.read_bytes(0, 5).unwrap(), &b"hello"[..]);
        assert_eq!(fs.node_cache().len(), 0);

        drop(reader);
        drop(slice);
        fs.remove_file("s", RemoveOption::default()).unwrap();
        assert!(!fs.is_exist("s").unwrap());
        assert_eq!(fs.metrics().quota_used, 0);
    }

    #[test]
    fn test_mount_dir_and_missing_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let external = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(external.path().join("sub")).unwrap();
        std::fs::write(external.path().join("sub/f"), b"external").unwrap();

        let fs = new_fs(dir.path(), FileSystemConfig::default());
        fs.mount_dir(external.path(), "ext", MountOption::default()).unwrap();
        assert_eq!(read(&fs, "ext/sub/f", FsOpenType::Buffered), &b"external"[..]);
        fs.remove_file("ext/sub/f", RemoveOption::default()).unwrap();
        assert!(external.path().join("sub/f").is_file());

        let absent = external.path().join("absent");
        assert!(matches!(
            fs.mount_dir(&absent, "gone", MountOption::default()),
            Err(Error::NotFound(_))
        ));
        fs.mount_dir(&absent, "gone", MountOption::default().may_non_exist())
            .unwrap();
        assert!(!fs.is_exist("gone").unwrap());
        fs.mount_file(&absent, "gone_file", MountOption::default().may_non_exist())
            .unwrap();
        assert!(matches!(
            fs.create_file_reader("gone_file", ReaderOption::load_config()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_root_link_is_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        write(&fs, "rt/a", b"flushed", &WriterOption::new());
        write(&fs, "rt/m", b"in memory", &WriterOption::mem());

        let link = fs.create_root_link("rt").unwrap();
        assert_eq!(link, format!("{ROOT_LINK_NAME}/rt"));
        assert_eq!(fs.list_dir(&link, true).unwrap(), vec!["a"]);

        write(&fs, "rt/b", b"later", &WriterOption::new());
        assert!(!fs.is_exist(&format!("{link}/b")).unwrap());

        fs.remove_directory(&link, RemoveOption::default()).unwrap();
        assert_eq!(read(&fs, "rt/a", FsOpenType::Mem), &b"flushed"[..]);
    }

    #[test]
    fn test_concurrent_readers_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path(), FileSystemConfig::default());
        let data = payload(5, 64 * 1024);
        write(&fs, "hot", &data, &WriterOption::new());

        std::thread::scope(|s| {
            for t in 0..8u64 {
                let fs = &fs;
                let data = &data;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    for _ in 0..50 {
                        let reader = fs
                            .create_file_reader("hot", ReaderOption::new(FsOpenType::Cache))
                            .unwrap();
                        let offset = rng.gen_range(0..data.len() - 1);
                        let len = rng.gen_range(1..=(data.len() - offset).min(10_000));
                        let got = reader.read_bytes(offset as u64, len).unwrap();
                        assert_eq!(got, &data[offset..offset + len]);
                    }
                });
            }
        });
        assert_eq!(fs.node_cache().len(), 1);
    }

    #[test]
    fn test_memory_quota_admission() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileSystemConfig {
            memory_quota_bytes: 1024,
            ..FileSystemConfig::in_memory()
        };
        let fs = new_fs(dir.path(), config.clone());
        let mut writer = fs.create_file_writer("big", &WriterOption::new()).unwrap();
        let err = writer.write(&[0u8; 2048]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);

        let load_configs = LoadConfigList::from_json(
            r#"{"load_config":[{"file_patterns":["x"],"load_strategy":"cache","load_strategy_param":{"cache_size":1}}]}"#,
        )
        .unwrap();
        let err = LogicalFileSystem::create(
            "test",
            dir.path(),
            FileSystemOptions::new(config, load_configs),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }
}
