//! Package storage
//!
//! Small files written below a package directory are staged in memory and
//! packed into append-only data shards on flush. The meta file is the
//! single source of truth: a shard byte not described by the meta does not
//! exist. Every flush writes a new shard, then replaces the meta, so a
//! crash between the two leaves at most an unreferenced shard behind which
//! recovery deletes.

use super::disk::dump_file;
use crate::layout::{PACKAGE_META_FILE, is_package_file, package_data_file, parse_package_shard};
use bytes::{BufMut, Bytes, BytesMut};
use indexfs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub length: u64,
    pub crc32c: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub shard: u32,
    pub offset: u64,
    pub length: u64,
}

/// Content of `package_file.__meta__`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageMeta {
    /// Checkpoint of the commit that last wrote this meta
    pub checkpoint: u64,
    pub shards: BTreeMap<u32, ShardMeta>,
    /// Entry name relative to the package directory
    pub files: BTreeMap<String, PackageEntry>,
    #[serde(default)]
    pub dirs: BTreeSet<String>,
}

impl PackageMeta {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::Serialization(format!("package meta: {e}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Serialization(format!("package meta: {e}")))
    }

    /// Read the meta of a package directory
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(PACKAGE_META_FILE);
        let data = fs::read(&path).map_err(|e| Error::io(path.to_string_lossy(), e))?;
        Self::from_json(&data)
    }

    fn check(&self) -> Result<()> {
        for (name, entry) in &self.files {
            let shard = self.shards.get(&entry.shard).ok_or_else(|| {
                Error::corruption(format!("package entry {name} in unknown shard {}", entry.shard))
            })?;
            if entry
                .offset
                .checked_add(entry.length)
                .is_none_or(|end| end > shard.length)
            {
                return Err(Error::corruption(format!(
                    "package entry {name} [{}, +{}) outside shard {} of {} bytes",
                    entry.offset, entry.length, entry.shard, shard.length
                )));
            }
        }
        Ok(())
    }
}

/// Location of a packed entry after a flush or merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedEntry {
    pub name: String,
    pub data_path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// One package directory: its durable meta plus staged files
#[derive(Debug)]
pub struct PackageState {
    dir: PathBuf,
    meta: PackageMeta,
    staged: BTreeMap<String, Bytes>,
    staged_dirs: BTreeSet<String>,
    /// Entries removed since the last flush
    dirty: bool,
}

impl PackageState {
    /// Empty package at the physical directory `dir`
    pub fn create(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            meta: PackageMeta::default(),
            staged: BTreeMap::new(),
            staged_dirs: BTreeSet::new(),
            dirty: false,
        }
    }

    /// Open a flushed package
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let meta = PackageMeta::load(&dir)?;
        meta.check()?;
        Ok(Self {
            meta,
            ..Self::create(dir)
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub const fn meta(&self) -> &PackageMeta {
        &self.meta
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.staged.contains_key(name) || self.meta.files.contains_key(name)
    }

    pub fn stage(&mut self, name: impl Into<String>, data: Bytes) {
        self.staged.insert(name.into(), data);
    }

    pub fn add_dir(&mut self, name: impl Into<String>) {
        self.staged_dirs.insert(name.into());
    }

    /// Logical removal; bytes are reclaimed by the next merge
    pub fn remove(&mut self, name: &str) -> bool {
        let staged = self.staged.remove(name).is_some();
        let flushed = self.meta.files.remove(name).is_some();
        self.dirty |= flushed;
        staged || flushed
    }

    /// Remove every entry equal to or below `prefix`
    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let below = |name: &str| crate::path::is_sub_path(prefix, name);
        let before = self.staged.len() + self.meta.files.len();
        self.staged.retain(|name, _| !below(name));
        self.meta.files.retain(|name, _| !below(name));
        self.staged_dirs.retain(|name| !below(name));
        self.meta.dirs.retain(|name| !below(name));
        let removed = before - self.staged.len() - self.meta.files.len();
        self.dirty = true;
        removed
    }

    /// Entries durable in the meta
    pub fn packed_entries(&self) -> impl Iterator<Item = PackedEntry> + '_ {
        self.meta.files.iter().map(|(name, entry)| PackedEntry {
            name: name.clone(),
            data_path: self.dir.join(package_data_file(entry.shard)),
            offset: entry.offset,
            length: entry.length,
        })
    }

    pub fn dirs(&self) -> impl Iterator<Item = &String> {
        self.meta.dirs.iter().chain(self.staged_dirs.iter())
    }

    fn next_shard(&self) -> u32 {
        self.meta
            .shards
            .last_key_value()
            .map_or(0, |(idx, _)| idx + 1)
    }

    /// Pack the staged files into a new shard and persist the meta
    pub fn flush(&mut self, checkpoint: u64) -> Result<Vec<PackedEntry>> {
        if self.staged.is_empty() && self.staged_dirs.is_empty() && !self.dirty {
            return Ok(Vec::new());
        }
        let mut flushed = Vec::with_capacity(self.staged.len());
        if !self.staged.is_empty() {
            let shard = self.next_shard();
            let data_path = self.dir.join(package_data_file(shard));
            let total: usize = self.staged.values().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for (name, data) in &self.staged {
                let offset = buf.len() as u64;
                buf.put_slice(data);
                self.meta.files.insert(
                    name.clone(),
                    PackageEntry {
                        shard,
                        offset,
                        length: data.len() as u64,
                    },
                );
                flushed.push(PackedEntry {
                    name: name.clone(),
                    data_path: data_path.clone(),
                    offset,
                    length: data.len() as u64,
                });
            }
            dump_file(&data_path, &buf)?;
            self.meta.shards.insert(
                shard,
                ShardMeta {
                    length: buf.len() as u64,
                    crc32c: crc32c::crc32c(&buf),
                },
            );
        }
        self.meta.dirs.append(&mut self.staged_dirs);
        self.meta.checkpoint = self.meta.checkpoint.max(checkpoint);
        dump_file(&self.dir.join(PACKAGE_META_FILE), &self.meta.to_json()?)?;
        self.staged.clear();
        self.dirty = false;
        debug!(
            "Flushed {} package files of {} at checkpoint {}",
            flushed.len(),
            self.dir.display(),
            self.meta.checkpoint
        );
        Ok(flushed)
    }

    /// Rewrite all live entries into one fresh shard and drop the others
    pub fn merge(&mut self, checkpoint: u64) -> Result<Vec<PackedEntry>> {
        self.flush(checkpoint)?;
        let old: Vec<u32> = self.meta.shards.keys().copied().collect();
        if old.len() <= 1 && !self.has_garbage() {
            return Ok(Vec::new());
        }
        for entry in self.packed_entries().collect::<Vec<_>>() {
            let data = read_range(&entry.data_path, entry.offset, entry.length)?;
            self.staged.insert(entry.name, data);
        }
        self.meta.files.clear();
        let merged = self.flush(checkpoint)?;
        self.meta.shards.retain(|idx, _| !old.contains(idx));
        dump_file(&self.dir.join(PACKAGE_META_FILE), &self.meta.to_json()?)?;
        for idx in old {
            let path = self.dir.join(package_data_file(idx));
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove merged shard {}: {}", path.display(), e);
            }
        }
        info!(
            "Merged package {} into {} entries",
            self.dir.display(),
            merged.len()
        );
        Ok(merged)
    }

    fn has_garbage(&self) -> bool {
        let live: u64 = self.meta.files.values().map(|e| e.length).sum();
        let stored: u64 = self.meta.shards.values().map(|s| s.length).sum();
        live < stored
    }

    /// Restore the package to the state of its meta
    ///
    /// A meta newer than `checkpoint` cannot be rolled back and fails with
    /// `Corruption`. Shards the meta does not reference are deleted, shards
    /// longer than recorded are truncated back and verified. `files` names
    /// physical files found in the directory; a missing meta with only
    /// unreferenced package files recovers to an empty package.
    pub fn recover(dir: impl Into<PathBuf>, checkpoint: u64, files: &[String]) -> Result<Self> {
        let dir = dir.into();
        let mut state = match Self::open(&dir) {
            Ok(state) => state,
            Err(e) if e.is_not_found() => Self::create(&dir),
            Err(e) => return Err(e),
        };
        if state.meta.checkpoint > checkpoint {
            return Err(Error::corruption(format!(
                "package {} meta at checkpoint {} is newer than {}",
                dir.display(),
                state.meta.checkpoint,
                checkpoint
            )));
        }

        for name in files {
            let name = crate::path::file_name(name);
            if !is_package_file(name) || name == PACKAGE_META_FILE {
                continue;
            }
            let referenced =
                parse_package_shard(name).is_some_and(|idx| state.meta.shards.contains_key(&idx));
            if !referenced {
                let path = dir.join(name);
                info!("Removing unreferenced package file {}", path.display());
                fs::remove_file(&path).or_else(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => Ok(()),
                    _ => Err(Error::io(path.to_string_lossy(), e)),
                })?;
            }
        }

        for (idx, shard) in &state.meta.shards {
            let path = dir.join(package_data_file(*idx));
            let actual = fs::metadata(&path)
                .map_err(|e| Error::io(path.to_string_lossy(), e))?
                .len();
            if actual < shard.length {
                return Err(Error::corruption(format!(
                    "package shard {} has {} bytes, meta records {}",
                    path.display(),
                    actual,
                    shard.length
                )));
            }
            if actual > shard.length {
                warn!(
                    "Truncating {} dirty bytes of {}",
                    actual - shard.length,
                    path.display()
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| Error::io(path.to_string_lossy(), e))?;
                file.set_len(shard.length)
                    .map_err(|e| Error::io(path.to_string_lossy(), e))?;
            }
            let data = read_range(&path, 0, shard.length)?;
            if crc32c::crc32c(&data) != shard.crc32c {
                return Err(Error::corruption(format!(
                    "package shard {} checksum mismatch",
                    path.display()
                )));
            }
        }
        state.meta.checkpoint = checkpoint;
        info!(
            "Recovered package {} with {} entries at checkpoint {}",
            dir.display(),
            state.meta.files.len(),
            checkpoint
        );
        Ok(state)
    }
}

/// Read `[offset, offset + length)` of a local file
pub fn read_range(path: &Path, offset: u64, length: u64) -> Result<Bytes> {
    use std::io::{Seek, SeekFrom};
    let len = usize::try_from(length)
        .map_err(|_| Error::bad_parameter(format!("{} range too large", path.display())))?;
    let mut file = fs::File::open(path).map_err(|e| Error::io(path.to_string_lossy(), e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(path.to_string_lossy(), e))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)
        .map_err(|e| Error::io(path.to_string_lossy(), e))?;
    Ok(Bytes::from(buf))
}

/// Delete every physical package file of a directory
pub fn remove_package_files(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(dir.to_string_lossy(), e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir.to_string_lossy(), e))?;
        if entry.file_name().to_str().is_some_and(is_package_file) {
            fs::remove_file(entry.path()).map_err(|e| Error::io(dir.to_string_lossy(), e))?;
        }
    }
    Ok(())
}
