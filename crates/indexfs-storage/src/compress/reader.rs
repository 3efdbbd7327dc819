//! Compressed file reader
//!
//! A reader owns no cursor: every call resolves its byte range to blocks
//! through the address mapper and decompresses them into call-local
//! buffers, so one reader may be shared by any number of threads.
//!
//! Two modes exist:
//! * normal: compressed bytes are read through the data file node (which
//!   may itself be block-cache backed) and decompressed on every access;
//! * decompress-cached: decompressed blocks are kept in a block cache,
//!   loading `batch_size` consecutive blocks per miss.

use super::address_mapper::CompressFileAddressMapper;
use super::compressor::Compressor;
use super::info::{CompressFileInfo, INFO_ADDRESS_MAPPER_LEN, INFO_HINT_DATA_LEN};
use crate::cache::{BlockAccessCounter, BlockCache, CacheKey};
use crate::file_node::FileNode;
use crate::reader::SingleIo;
use bytes::{Bytes, BytesMut};
use indexfs_common::{Error, Result, file_identity};
use std::collections::HashMap;
use std::sync::Arc;

/// Address mapper and hint data of one compressed file
///
/// Loaded once per file and shared by all its readers.
#[derive(Debug)]
pub struct CompressMeta {
    pub mapper: CompressFileAddressMapper,
    pub hint: Option<Bytes>,
}

impl CompressMeta {
    /// Decode the serialized mapper followed by the hint data
    pub fn decode(info: &CompressFileInfo, tail: &[u8]) -> Result<Self> {
        let mapper_len = usize::try_from(info.additional_u64(INFO_ADDRESS_MAPPER_LEN)?)
            .map_err(|_| Error::corruption("address mapper length overflow"))?;
        let hint_len = usize::try_from(info.additional_u64(INFO_HINT_DATA_LEN)?)
            .map_err(|_| Error::corruption("hint data length overflow"))?;
        if mapper_len.checked_add(hint_len) != Some(tail.len()) {
            return Err(Error::corruption(format!(
                "compress meta of {} bytes, expected mapper {} + hint {}",
                tail.len(),
                mapper_len,
                hint_len
            )));
        }
        let mapper = CompressFileAddressMapper::deserialize(&tail[..mapper_len])?;
        if mapper.block_count() as u64 != info.block_count
            || mapper.compress_file_length() != info.compress_file_len
        {
            return Err(Error::corruption(format!(
                "address mapper ({} blocks, {} bytes) disagrees with compress info ({} blocks, {} bytes)",
                mapper.block_count(),
                mapper.compress_file_length(),
                info.block_count,
                info.compress_file_len
            )));
        }
        let hint = (hint_len > 0).then(|| Bytes::copy_from_slice(&tail[mapper_len..]));
        Ok(Self { mapper, hint })
    }

    pub fn memory_use(&self) -> u64 {
        self.mapper.memory_use() + self.hint.as_ref().map_or(0, |h| h.len() as u64)
    }
}

#[derive(Debug)]
enum ReadMode {
    Normal,
    DecompressCached {
        cache: Arc<BlockCache>,
        file_id: u64,
        batch_size: usize,
    },
}

#[derive(Debug)]
struct ReaderInner {
    path: String,
    node: Arc<FileNode>,
    info: CompressFileInfo,
    meta: Arc<CompressMeta>,
    compressor: Compressor,
    mode: ReadMode,
}

/// Reader of a compressed file, cheap to clone
#[derive(Debug, Clone)]
pub struct CompressFileReader {
    inner: Arc<ReaderInner>,
}

/// Blocks touched by one call, decompressed at most once
type BlockSession = HashMap<usize, Bytes>;

impl CompressFileReader {
    /// Normal-mode reader over the data file `node`
    pub fn new(
        path: impl Into<String>,
        node: Arc<FileNode>,
        info: CompressFileInfo,
        meta: Arc<CompressMeta>,
    ) -> Result<Self> {
        let compressor = Compressor::from_name(&info.compressor_name, None)?;
        Ok(Self {
            inner: Arc::new(ReaderInner {
                path: path.into(),
                node,
                info,
                meta,
                compressor,
                mode: ReadMode::Normal,
            }),
        })
    }

    /// Reader keeping decompressed blocks in `cache`
    pub fn decompress_cached(
        path: impl Into<String>,
        node: Arc<FileNode>,
        info: CompressFileInfo,
        meta: Arc<CompressMeta>,
        cache: Arc<BlockCache>,
        batch_size: usize,
    ) -> Result<Self> {
        let path = path.into();
        let compressor = Compressor::from_name(&info.compressor_name, None)?;
        let file_id = file_identity(&format!("{}#decompressed", node.physical_path()))
            ^ file_identity(&path);
        Ok(Self {
            inner: Arc::new(ReaderInner {
                path,
                node,
                info,
                meta,
                compressor,
                mode: ReadMode::DecompressCached {
                    cache,
                    file_id,
                    batch_size: batch_size.max(1),
                },
            }),
        })
    }

    pub fn logical_path(&self) -> &str {
        &self.inner.path
    }

    /// Decompressed length
    pub fn logic_length(&self) -> u64 {
        self.inner.info.decompress_file_len
    }

    pub fn compress_info(&self) -> &CompressFileInfo {
        &self.inner.info
    }

    pub fn mapper(&self) -> &CompressFileAddressMapper {
        &self.inner.meta.mapper
    }

    pub fn is_decompress_cached(&self) -> bool {
        matches!(self.inner.mode, ReadMode::DecompressCached { .. })
    }

    /// Independent session sharing the mapper, node and cache
    #[must_use]
    pub fn create_session_reader(&self) -> Self {
        self.clone()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let size = self.logic_length();
        if offset.checked_add(len as u64).is_none_or(|end| end > size) {
            return Err(Error::OutOfRange {
                offset,
                length: len as u64,
                size,
            });
        }
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut counter = BlockAccessCounter::default();
        self.read_with_counter(buf, offset, &mut counter)
    }

    pub fn read_with_counter(
        &self,
        buf: &mut [u8],
        offset: u64,
        counter: &mut BlockAccessCounter,
    ) -> Result<()> {
        let mut session = BlockSession::new();
        self.read_in_session(buf, offset, &mut session, counter)
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.read(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }

    /// Serve every request independently; failures stay per entry
    pub fn batch_read(&self, ios: &[SingleIo]) -> Vec<Result<Bytes>> {
        let mut counter = BlockAccessCounter::default();
        self.batch_read_with_counter(ios, &mut counter)
    }

    /// Batch read where each touched block is fetched at most once
    pub fn batch_read_with_counter(
        &self,
        ios: &[SingleIo],
        counter: &mut BlockAccessCounter,
    ) -> Vec<Result<Bytes>> {
        let mut session = BlockSession::new();
        ios.iter()
            .map(|io| {
                let mut buf = vec![0u8; io.len];
                self.read_in_session(&mut buf, io.offset, &mut session, counter)
                    .map(|()| Bytes::from(buf))
            })
            .collect()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_in_session(
        &self,
        buf: &mut [u8],
        offset: u64,
        session: &mut BlockSession,
        counter: &mut BlockAccessCounter,
    ) -> Result<()> {
        self.check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let block_size = self.inner.info.block_size;
        let end = offset + buf.len() as u64;
        let first = offset / block_size;
        let last = (end - 1) / block_size;
        for idx in first..=last {
            let block = self.block(idx as usize, session, counter)?;
            let block_start = idx * block_size;
            let from = offset.max(block_start);
            let to = end.min(block_start + block.len() as u64);
            if to <= from {
                return Err(Error::corruption(format!(
                    "{}: block {} shorter than expected",
                    self.inner.path, idx
                )));
            }
            buf[(from - offset) as usize..(to - offset) as usize]
                .copy_from_slice(&block[(from - block_start) as usize..(to - block_start) as usize]);
        }
        Ok(())
    }

    fn block(
        &self,
        idx: usize,
        session: &mut BlockSession,
        counter: &mut BlockAccessCounter,
    ) -> Result<Bytes> {
        if let Some(block) = session.get(&idx) {
            counter.no_new_block += 1;
            return Ok(block.clone());
        }
        let block = match &self.inner.mode {
            ReadMode::Normal => self.decompress_range(idx, idx + 1, counter)?.remove(0),
            ReadMode::DecompressCached {
                cache,
                file_id,
                batch_size,
            } => {
                let key = CacheKey::new(*file_id, idx as u64);
                if let Some(block) = cache.get(&key) {
                    counter.hit += 1;
                    block
                } else {
                    counter.miss += 1;
                    let end = (idx + batch_size).min(self.inner.meta.mapper.block_count());
                    let mut blocks = self
                        .decompress_range(idx, end, &mut BlockAccessCounter::default())?
                        .into_iter();
                    let first = blocks.next().unwrap_or_default();
                    cache.insert(key, first.clone());
                    for (other, block) in (idx + 1..end).zip(blocks) {
                        let other = CacheKey::new(*file_id, other as u64);
                        if !cache.contains(&other) {
                            cache.insert(other, block);
                        }
                    }
                    first
                }
            }
        };
        session.insert(idx, block.clone());
        Ok(block)
    }

    /// Read blocks `[start, end)` with one node read and decompress each
    #[allow(clippy::cast_possible_truncation)]
    fn decompress_range(
        &self,
        start: usize,
        end: usize,
        counter: &mut BlockAccessCounter,
    ) -> Result<Vec<Bytes>> {
        let inner = &*self.inner;
        let mapper = &inner.meta.mapper;
        if end > mapper.block_count() || start >= end {
            return Err(Error::corruption(format!(
                "{}: block range {}..{} outside {} blocks",
                inner.path,
                start,
                end,
                mapper.block_count()
            )));
        }
        let from = mapper.compress_block_address(start);
        let to = mapper.compress_block_address(end - 1) + mapper.compress_block_length(end - 1);
        let compressed = if let Some(data) = inner.node.as_slice() {
            let region = data.get(from as usize..to as usize).ok_or_else(|| {
                Error::corruption(format!("{}: compressed data truncated", inner.path))
            })?;
            Bytes::copy_from_slice(region)
        } else {
            let mut region = BytesMut::zeroed((to - from) as usize);
            inner.node.read_with_counter(&mut region, from, counter)?;
            region.freeze()
        };

        (start..end)
            .map(|idx| {
                let at = (mapper.compress_block_address(idx) - from) as usize;
                let len = mapper.compress_block_length(idx) as usize;
                let hint = if mapper.is_compress_block_use_hint_data(idx) {
                    Some(inner.meta.hint.as_deref().ok_or_else(|| {
                        Error::corruption(format!(
                            "{}: block {} needs hint data but none is stored",
                            inner.path, idx
                        ))
                    })?)
                } else {
                    None
                };
                let logic_len = inner.info.block_logic_length(idx as u64) as usize;
                inner
                    .compressor
                    .decompress(&compressed[at..at + len], hint, logic_len)
                    .map(Bytes::from)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{CompressFileWriter, CompressorParams};
    use crate::memory::MemoryQuota;
    use crate::storage::mem::MemFileWriter;
    use crate::storage::{CloseHook, ClosedContent};
    use crate::writer::FileWriter;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    type Sink = Arc<Mutex<HashMap<String, Bytes>>>;

    fn mem_writer(name: &str, sink: &Sink, quota: &Arc<MemoryQuota>) -> Box<dyn FileWriter> {
        let sink = Arc::clone(sink);
        Box::new(
            MemFileWriter::create(
                name,
                quota,
                CloseHook::new(move |file| {
                    if let ClosedContent::Mem { data, .. } = file.content {
                        sink.lock().insert(file.logical_path, data);
                    }
                    Ok(())
                }),
            )
            .unwrap(),
        )
    }

    fn payload(len: usize, seed: u64) -> Vec<u8> {
        let words: [&[u8]; 6] = [b"index ", b"segment ", b"posting ", b"attr ", b"doc ", b"42 "];
        let mut rng = StdRng::seed_from_u64(seed);
        let mut out = Vec::with_capacity(len + 16);
        while out.len() < len {
            out.extend_from_slice(words[rng.gen_range(0..words.len())]);
        }
        out.truncate(len);
        out
    }

    /// Compress `data` in memory and open a normal-mode reader over it
    fn build(
        data: &[u8],
        compressor: &str,
        block_size: usize,
        params: CompressorParams,
    ) -> CompressFileReader {
        build_with_lengths(data, compressor, block_size, params).0
    }

    /// Like `build`, also returning the writer's stored and logical lengths
    fn build_with_lengths(
        data: &[u8],
        compressor: &str,
        block_size: usize,
        params: CompressorParams,
    ) -> (CompressFileReader, u64, u64) {
        let quota = Arc::new(MemoryQuota::unlimited());
        let sink: Sink = Arc::default();
        let meta = params
            .enable_meta_file
            .then(|| mem_writer("meta", &sink, &quota));
        let mut writer = CompressFileWriter::new(
            "f",
            mem_writer("data", &sink, &quota),
            mem_writer("info", &sink, &quota),
            meta,
            Compressor::from_name(compressor, None).unwrap(),
            block_size,
            params,
        )
        .unwrap();
        for chunk in data.chunks(1000) {
            writer.write(chunk).unwrap();
        }
        writer.close().unwrap();
        let lengths = (writer.length(), writer.logic_length());

        let files = sink.lock();
        let info = CompressFileInfo::from_json(&files["info"]).unwrap();
        let stored = &files["data"];
        let tail = files.get("meta").map_or_else(
            || stored.slice(info.compress_file_len as usize..),
            Bytes::clone,
        );
        let meta = Arc::new(CompressMeta::decode(&info, &tail).unwrap());
        let node = Arc::new(FileNode::mem(
            "f",
            stored.slice(..info.compress_file_len as usize),
        ));
        let reader = CompressFileReader::new("f", node, info, meta).unwrap();
        (reader, lengths.0, lengths.1)
    }

    #[test]
    fn test_lz4_reads_match_source() {
        let data = payload(73 * 1024, 1);
        let (reader, length, logic_length) =
            build_with_lengths(&data, "lz4", 4096, CompressorParams::default());
        assert!(length < 73 * 1024);
        assert_eq!(logic_length, 73 * 1024);
        assert_eq!(reader.logic_length(), data.len() as u64);
        assert_eq!(reader.compress_info().block_count, 19);
        assert!(reader.compress_info().compress_file_len < data.len() as u64);

        for (offset, len) in [(0usize, 4096usize), (4096, 4096), (data.len() - 10, 10)] {
            let got = reader.read_bytes(offset as u64, len).unwrap();
            assert_eq!(&got[..], &data[offset..offset + len]);
        }
        // Spanning several blocks
        let got = reader.read_bytes(4000, 9000).unwrap();
        assert_eq!(&got[..], &data[4000..13000]);
        assert!(matches!(
            reader.read_bytes(data.len() as u64 - 5, 10),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_empty_file() {
        let reader = build(&[], "zstd", 4096, CompressorParams::default());
        assert_eq!(reader.logic_length(), 0);
        assert_eq!(reader.compress_info().block_count, 0);
        assert!(reader.read_bytes(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_batch_read_reuses_blocks() {
        let data = payload(20 * 1024, 2);
        let reader = build(&data, "zlib", 4096, CompressorParams::default());
        let cache = Arc::new(BlockCache::with_capacity_bytes(1 << 20, 4096));
        let reader = CompressFileReader::decompress_cached(
            "f",
            Arc::clone(&reader.inner.node),
            reader.inner.info.clone(),
            Arc::clone(&reader.inner.meta),
            cache,
            1,
        )
        .unwrap();

        let ios = [SingleIo::new(10, 20), SingleIo::new(100, 50)];
        let mut counter = BlockAccessCounter::default();
        let out = reader.batch_read_with_counter(&ios, &mut counter);
        assert_eq!(&out[0].as_ref().unwrap()[..], &data[10..30]);
        assert_eq!(&out[1].as_ref().unwrap()[..], &data[100..150]);
        assert_eq!(counter.miss, 1);
        assert_eq!(counter.no_new_block, 1);

        // A later call finds the block in the cache
        let mut counter = BlockAccessCounter::default();
        let mut buf = [0u8; 8];
        reader.read_with_counter(&mut buf, 200, &mut counter).unwrap();
        assert_eq!(counter.hit, 1);
        assert_eq!(counter.miss, 0);
    }

    #[test]
    fn test_batch_read_failures_are_independent() {
        let data = payload(10 * 1024, 3);
        let reader = build(&data, "lz4", 1024, CompressorParams::default());
        let ios = [
            SingleIo::new(0, 16),
            SingleIo::new(data.len() as u64, 1),
            SingleIo::new(2048, 16),
        ];
        let out = reader.batch_read(&ios);
        assert_eq!(&out[0].as_ref().unwrap()[..], &data[..16]);
        assert!(out[1].is_err());
        assert_eq!(&out[2].as_ref().unwrap()[..], &data[2048..2064]);
    }

    #[test]
    fn test_hint_data_and_meta_file() {
        let data = payload(64 * 1024, 4);
        let params = CompressorParams {
            enable_hint_data: true,
            enable_meta_file: true,
            hint_sample_ratio: 0.5,
            hint_sample_block_count: 2,
            hint_always_use_hint: true,
            encode_address_mapper: true,
            ..CompressorParams::default()
        };
        let reader = build(&data, "zstd", 2048, params);
        assert_eq!(reader.mapper().hint_block_count(), reader.mapper().block_count());
        assert!(reader.inner.meta.hint.is_some());
        assert_eq!(reader.read_bytes(0, data.len()).unwrap(), Bytes::from(data));
    }

    #[test]
    fn test_meta_mismatch_is_corruption() {
        let data = payload(8 * 1024, 5);
        let reader = build(&data, "lz4", 1024, CompressorParams::default());
        let mut info = reader.compress_info().clone();
        info.additional_info
            .insert(INFO_ADDRESS_MAPPER_LEN.to_string(), "3".to_string());
        assert!(CompressMeta::decode(&info, &[0u8; 3]).is_err());
    }

    #[test]
    fn test_session_readers_concurrent() {
        let data = payload(32 * 1024, 6);
        let reader = build(&data, "zstd", 4096, CompressorParams::default());
        std::thread::scope(|s| {
            for t in 0..4u64 {
                let session = reader.create_session_reader();
                let data = &data;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    for _ in 0..50 {
                        let offset = rng.gen_range(0..data.len() - 100);
                        let len = rng.gen_range(1..100);
                        let got = session.read_bytes(offset as u64, len).unwrap();
                        assert_eq!(&got[..], &data[offset..offset + len]);
                    }
                });
            }
        });
    }
}
