//! File nodes
//!
//! A file node is one physical file (or one package entry) materialized in
//! a fixed representation. The representation is chosen once, when the
//! node is created, and every read dispatches on the closed [`NodeContent`]
//! enum.

use crate::cache::{BlockAccessCounter, BlockCache, CacheKey};
use crate::load_config::{LoadConfigList, MmapLoadStrategy};
use crate::memory::{MemoryQuota, MemoryReservation};
use crate::raw_io::RawFile;
use crate::slice::SliceFile;
use bytes::Bytes;
use indexfs_common::{Error, FsFileType, Result, file_identity};
use memmap2::{Advice, Mmap, MmapOptions};
use std::fs::File;
use std::sync::Arc;
use tracing::{debug, warn};

/// Block-cache backed content
#[derive(Debug)]
pub struct BlockContent {
    file: RawFile,
    base: u64,
    cache: Arc<BlockCache>,
    file_id: u64,
    block_size: u64,
    io_batch_size: u64,
}

/// Materialized bytes of a node
#[derive(Debug)]
pub enum NodeContent {
    Mem(Bytes),
    Mmap(Mmap),
    Block(BlockContent),
    Buffered { file: RawFile, base: u64 },
    Slice(Arc<SliceFile>),
}

/// Where a node reads its bytes from
#[derive(Debug, Clone)]
pub struct PhysicalSource<'a> {
    pub path: &'a str,
    /// Byte offset of the logical file inside the physical file
    pub base: u64,
    pub length: u64,
}

#[derive(Debug)]
pub struct FileNode {
    logical_path: String,
    physical_path: String,
    file_type: FsFileType,
    length: u64,
    content: NodeContent,
    _reservation: Option<MemoryReservation>,
}

impl FileNode {
    /// Node over bytes already in memory
    pub fn mem(logical_path: impl Into<String>, data: Bytes) -> Self {
        Self {
            logical_path: logical_path.into(),
            physical_path: String::new(),
            file_type: FsFileType::Mem,
            length: data.len() as u64,
            content: NodeContent::Mem(data),
            _reservation: None,
        }
    }

    /// Read the whole source into memory
    pub fn load_mem(
        logical_path: impl Into<String>,
        source: &PhysicalSource<'_>,
        quota: &Arc<MemoryQuota>,
    ) -> Result<Self> {
        let reservation = quota.reserve(source.length)?;
        let file = RawFile::open(source.path, false)?;
        let len = usize::try_from(source.length)
            .map_err(|_| Error::bad_parameter(format!("{} too large for memory", source.path)))?;
        let mut data = vec![0u8; len];
        let n = file.read_at(source.base, &mut data)?;
        if n != len {
            return Err(Error::corruption(format!(
                "{}: expected {} bytes at {}, read {}",
                source.path, len, source.base, n
            )));
        }
        Ok(Self {
            logical_path: logical_path.into(),
            physical_path: source.path.to_string(),
            file_type: FsFileType::Mem,
            length: source.length,
            content: NodeContent::Mem(Bytes::from(data)),
            _reservation: Some(reservation),
        })
    }

    /// Map the source, locking it slice by slice when `lock` is set
    pub fn mmap(
        logical_path: impl Into<String>,
        source: &PhysicalSource<'_>,
        strategy: &MmapLoadStrategy,
        lock: bool,
        load_configs: &LoadConfigList,
        quota: &Arc<MemoryQuota>,
    ) -> Result<Self> {
        let logical_path = logical_path.into();
        let file_type = if lock {
            FsFileType::MmapLock
        } else {
            FsFileType::Mmap
        };
        if source.length == 0 {
            return Ok(Self {
                file_type,
                physical_path: source.path.to_string(),
                ..Self::mem(logical_path, Bytes::new())
            });
        }

        let file = File::open(source.path).map_err(|e| Error::io(source.path, e))?;
        let len = usize::try_from(source.length)
            .map_err(|_| Error::bad_parameter(format!("{} too large to map", source.path)))?;
        let map = Self::map_range(&file, source.base, len).map_err(|e| Error::io(source.path, e))?;

        if strategy.advise_random {
            if let Err(e) = map.advise(Advice::Random) {
                debug!("madvise(random) failed on {}: {}", source.path, e);
            }
        }

        let reservation = if lock {
            let reservation = quota.reserve(source.length)?;
            Self::lock_slices(&map, source.path, strategy, load_configs);
            Some(reservation)
        } else {
            None
        };

        Ok(Self {
            logical_path,
            physical_path: source.path.to_string(),
            file_type,
            length: source.length,
            content: NodeContent::Mmap(map),
            _reservation: reservation,
        })
    }

    #[allow(unsafe_code)]
    fn map_range(file: &File, offset: u64, len: usize) -> std::io::Result<Mmap> {
        // SAFETY: files below a file system root are immutable once written;
        // nothing truncates a file while a node maps it.
        unsafe { MmapOptions::new().offset(offset).len(len).map(file) }
    }

    #[allow(unsafe_code)]
    fn lock_slices(
        map: &Mmap,
        path: &str,
        strategy: &MmapLoadStrategy,
        load_configs: &LoadConfigList,
    ) {
        let slice = usize::try_from(strategy.slice).unwrap_or(usize::MAX).max(1);
        let mut offset = 0usize;
        while offset < map.len() {
            let len = slice.min(map.len() - offset);
            if let Err(e) = map.advise_range(Advice::WillNeed, offset, len) {
                debug!("madvise(willneed) failed on {}: {}", path, e);
            }
            // SAFETY: [offset, offset + len) lies inside the live mapping.
            let ret = unsafe { libc::mlock(map.as_ptr().add(offset).cast(), len) };
            if ret != 0 {
                warn!(
                    "mlock of {} at {} failed: {}, leaving the rest unlocked",
                    path,
                    offset,
                    std::io::Error::last_os_error()
                );
                return;
            }
            offset += len;
            if offset < map.len() {
                if let Some(pause) =
                    strategy.lock_throttle(load_configs.load_speed_limit_enabled())
                {
                    std::thread::sleep(pause);
                }
            }
        }
        debug!("Locked {} bytes of {}", map.len(), path);
    }

    /// Node reading through a block cache
    pub fn block(
        logical_path: impl Into<String>,
        source: &PhysicalSource<'_>,
        cache: Arc<BlockCache>,
        io_batch_size: usize,
        direct_io: bool,
    ) -> Result<Self> {
        let file = RawFile::open(source.path, direct_io)?;
        let file_id = file_identity(&format!("{}:{}", source.path, source.base));
        let block_size = cache.block_size().max(1) as u64;
        Ok(Self {
            logical_path: logical_path.into(),
            physical_path: source.path.to_string(),
            file_type: FsFileType::Block,
            length: source.length,
            content: NodeContent::Block(BlockContent {
                file,
                base: source.base,
                cache,
                file_id,
                block_size,
                io_batch_size: io_batch_size.max(1) as u64,
            }),
            _reservation: None,
        })
    }

    /// Read-through node
    pub fn buffered(
        logical_path: impl Into<String>,
        source: &PhysicalSource<'_>,
        direct_io: bool,
    ) -> Result<Self> {
        let file = RawFile::open(source.path, direct_io)?;
        Ok(Self {
            logical_path: logical_path.into(),
            physical_path: source.path.to_string(),
            file_type: FsFileType::Buffered,
            length: source.length,
            content: NodeContent::Buffered {
                file,
                base: source.base,
            },
            _reservation: None,
        })
    }

    pub fn slice(logical_path: impl Into<String>, slice: Arc<SliceFile>) -> Self {
        Self {
            logical_path: logical_path.into(),
            physical_path: String::new(),
            file_type: FsFileType::Slice,
            length: slice.length(),
            content: NodeContent::Slice(slice),
            _reservation: None,
        }
    }

    pub fn logical_path(&self) -> &str {
        &self.logical_path
    }

    pub fn physical_path(&self) -> &str {
        &self.physical_path
    }

    pub const fn file_type(&self) -> FsFileType {
        self.file_type
    }

    pub fn length(&self) -> u64 {
        match &self.content {
            NodeContent::Slice(slice) => slice.length(),
            _ => self.length,
        }
    }

    pub const fn content(&self) -> &NodeContent {
        &self.content
    }

    /// Contiguous in-memory view, for mem and mmap nodes
    pub fn as_slice(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Mem(data) => Some(data),
            NodeContent::Mmap(map) => Some(map),
            _ => None,
        }
    }

    /// Bytes held in memory by this node
    pub fn memory_use(&self) -> u64 {
        match &self.content {
            NodeContent::Mem(data) => data.len() as u64,
            NodeContent::Mmap(_) if self.file_type == FsFileType::MmapLock => self.length,
            NodeContent::Slice(slice) => slice.capacity(),
            _ => 0,
        }
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let size = self.length();
        if offset.checked_add(len as u64).is_none_or(|end| end > size) {
            return Err(Error::OutOfRange {
                offset,
                length: len as u64,
                size,
            });
        }
        Ok(())
    }

    /// Fill `buf` from `offset`
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut counter = BlockAccessCounter::default();
        self.read_with_counter(buf, offset, &mut counter)
    }

    /// Fill `buf` from `offset`, counting block cache traffic
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_with_counter(
        &self,
        buf: &mut [u8],
        offset: u64,
        counter: &mut BlockAccessCounter,
    ) -> Result<()> {
        self.check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        match &self.content {
            NodeContent::Mem(_) | NodeContent::Mmap(_) => {
                let data = self.as_slice().unwrap_or_default();
                let start = offset as usize;
                buf.copy_from_slice(&data[start..start + buf.len()]);
                Ok(())
            }
            NodeContent::Buffered { file, base } => {
                let n = file.read_at(base + offset, buf)?;
                if n != buf.len() {
                    return Err(Error::corruption(format!(
                        "{}: short read at {}",
                        self.physical_path, offset
                    )));
                }
                Ok(())
            }
            NodeContent::Block(block) => block.read(buf, offset, self.length, counter),
            NodeContent::Slice(slice) => {
                slice.read(buf, offset)?;
                Ok(())
            }
        }
    }

    /// Copy of `[offset, offset + len)`; zero-copy for mem nodes
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Bytes> {
        self.check_range(offset, len)?;
        if let NodeContent::Mem(data) = &self.content {
            let start = offset as usize;
            return Ok(data.slice(start..start + len));
        }
        let mut buf = vec![0u8; len];
        self.read(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }
}

impl BlockContent {
    pub const fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(
        &self,
        buf: &mut [u8],
        offset: u64,
        length: u64,
        counter: &mut BlockAccessCounter,
    ) -> Result<()> {
        let end = offset + buf.len() as u64;
        let first = offset / self.block_size;
        let last = (end - 1) / self.block_size;
        for idx in first..=last {
            let block = self.fetch_block(idx, length, counter)?;
            let block_start = idx * self.block_size;
            let from = offset.max(block_start);
            let to = end.min(block_start + block.len() as u64);
            let dst = (from - offset) as usize..(to - offset) as usize;
            let src = (from - block_start) as usize..(to - block_start) as usize;
            buf[dst].copy_from_slice(&block[src]);
        }
        Ok(())
    }

    /// Block `idx` from the cache, loading a batch of blocks on a miss
    #[allow(clippy::cast_possible_truncation)]
    fn fetch_block(
        &self,
        idx: u64,
        length: u64,
        counter: &mut BlockAccessCounter,
    ) -> Result<Bytes> {
        let key = CacheKey::new(self.file_id, idx);
        if let Some(block) = self.cache.get(&key) {
            counter.hit += 1;
            return Ok(block);
        }
        counter.miss += 1;

        let block_count = length.div_ceil(self.block_size);
        let batch_end = (idx + self.io_batch_size).min(block_count);
        let start = idx * self.block_size;
        let end = (batch_end * self.block_size).min(length);
        let mut data = vec![0u8; (end - start) as usize];
        let n = self.file.read_at(self.base + start, &mut data)?;
        if n != data.len() {
            return Err(Error::corruption(format!(
                "{}: short block read at {}",
                self.file.path(),
                start
            )));
        }
        let data = Bytes::from(data);

        let mut requested = Bytes::new();
        for (i, block_idx) in (idx..batch_end).enumerate() {
            let from = i * self.block_size as usize;
            let to = (from + self.block_size as usize).min(data.len());
            let block = data.slice(from..to);
            if block_idx == idx {
                requested = block.clone();
                self.cache.insert(key, block);
            } else {
                let other = CacheKey::new(self.file_id, block_idx);
                if !self.cache.contains(&other) {
                    self.cache.insert(other, block);
                }
            }
        }
        Ok(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::Ordering;
    use tempfile::NamedTempFile;

    fn fixture(len: usize) -> (NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&data).unwrap();
        temp.flush().unwrap();
        (temp, data)
    }

    fn source(temp: &NamedTempFile, base: u64, length: u64) -> PhysicalSource<'_> {
        PhysicalSource {
            path: temp.path().to_str().unwrap(),
            base,
            length,
        }
    }

    #[test]
    fn test_mem_and_buffered_agree() {
        let (temp, data) = fixture(10_000);
        let quota = Arc::new(MemoryQuota::unlimited());
        let src = source(&temp, 0, 10_000);
        let mem = FileNode::load_mem("a", &src, &quota).unwrap();
        let buffered = FileNode::buffered("a", &src, false).unwrap();
        assert_eq!(quota.used(), 10_000);

        for node in [&mem, &buffered] {
            assert_eq!(node.read_bytes(1234, 100).unwrap(), &data[1234..1334]);
            assert!(matches!(
                node.read_bytes(9990, 20),
                Err(Error::OutOfRange { .. })
            ));
        }
        assert_eq!(mem.file_type(), FsFileType::Mem);
        assert_eq!(buffered.file_type(), FsFileType::Buffered);
    }

    #[test]
    fn test_mmap_with_base_offset() {
        let (temp, data) = fixture(20_000);
        let quota = Arc::new(MemoryQuota::unlimited());
        let list = LoadConfigList::new();
        let src = source(&temp, 5000, 10_000);
        let node = FileNode::mmap(
            "pkg/entry",
            &src,
            &MmapLoadStrategy::locked(),
            true,
            &list,
            &quota,
        )
        .unwrap();
        assert_eq!(node.file_type(), FsFileType::MmapLock);
        assert_eq!(node.length(), 10_000);
        assert_eq!(node.read_bytes(0, 10).unwrap(), &data[5000..5010]);
        assert_eq!(node.memory_use(), 10_000);
    }

    #[test]
    fn test_empty_mmap() {
        let (temp, _) = fixture(0);
        let quota = Arc::new(MemoryQuota::unlimited());
        let node = FileNode::mmap(
            "e",
            &source(&temp, 0, 0),
            &MmapLoadStrategy::default(),
            false,
            &LoadConfigList::new(),
            &quota,
        )
        .unwrap();
        assert_eq!(node.file_type(), FsFileType::Mmap);
        assert_eq!(node.length(), 0);
        assert!(node.read_bytes(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_block_node_counts_hits() {
        let (temp, data) = fixture(3 * 4096 + 100);
        let cache = Arc::new(BlockCache::with_capacity_bytes(1 << 20, 4096));
        let len = data.len() as u64;
        let node = FileNode::block("b", &source(&temp, 0, len), Arc::clone(&cache), 2, false)
            .unwrap();

        let mut counter = BlockAccessCounter::default();
        let mut buf = vec![0u8; 200];
        node.read_with_counter(&mut buf, 4000, &mut counter).unwrap();
        assert_eq!(&buf[..], &data[4000..4200]);
        // Block 0 missed and loaded block 1 in the same batch
        assert_eq!(counter, BlockAccessCounter { hit: 1, miss: 1, no_new_block: 0 });

        let mut tail = vec![0u8; 100];
        node.read_with_counter(&mut tail, 3 * 4096, &mut counter).unwrap();
        assert_eq!(&tail[..], &data[3 * 4096..]);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_slice_node_not_cacheable() {
        let quota = Arc::new(MemoryQuota::unlimited());
        let slice = Arc::new(SliceFile::new("s", 8, 2, &quota).unwrap());
        slice.append(b"abcdef").unwrap();
        let node = FileNode::slice("s", Arc::clone(&slice));
        assert!(!node.file_type().is_cacheable());
        slice.append(b"gh").unwrap();
        assert_eq!(node.read_bytes(4, 4).unwrap(), Bytes::from_static(b"efgh"));
    }
}
