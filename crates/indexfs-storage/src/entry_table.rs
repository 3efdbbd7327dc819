//! Logical-to-physical entry table
//!
//! Every logical file maps to exactly one physical location. Directories
//! are implied by the files below them; empty directories are stored as
//! explicit directory entries.

use crate::layout::entry_table_file;
use crate::memory::MemoryReservation;
use crate::path::{ancestors, is_sub_path, join_path, relative_to};
use crate::slice::SliceFile;
use crate::storage::disk::dump_file;
use bytes::Bytes;
use indexfs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the bytes of a logical file live
#[derive(Debug, Clone)]
pub enum PhysicalLocation {
    /// A whole local file
    Disk { path: PathBuf },
    /// Bytes held in memory, not yet flushed
    Mem { data: Bytes },
    /// A range of a package data shard
    Package {
        data_path: PathBuf,
        offset: u64,
        length: u64,
    },
    /// Pool-backed slice file
    Slice(Arc<SliceFile>),
    /// Mounted with `may_non_exist` and absent on disk
    Missing,
}

impl PhysicalLocation {
    /// Physical file path and base offset, for on-disk locations
    pub fn disk_source(&self) -> Option<(&Path, u64)> {
        match self {
            Self::Disk { path } => Some((path, 0)),
            Self::Package {
                data_path, offset, ..
            } => Some((data_path, *offset)),
            _ => None,
        }
    }

    /// Same physical bytes
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Disk { path: a }, Self::Disk { path: b }) => a == b,
            (Self::Mem { data: a }, Self::Mem { data: b }) => a == b,
            (
                Self::Package {
                    data_path: a,
                    offset: ao,
                    length: al,
                },
                Self::Package {
                    data_path: b,
                    offset: bo,
                    length: bl,
                },
            ) => a == b && ao == bo && al == bl,
            (Self::Slice(a), Self::Slice(b)) => Arc::ptr_eq(a, b),
            (Self::Missing, Self::Missing) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct Entry {
    pub location: PhysicalLocation,
    pub length: u64,
    pub is_dir: bool,
    /// Mounted from a committed version; never deleted physically
    pub read_only: bool,
    reservation: Option<MemoryReservation>,
}

impl Entry {
    pub const fn file(location: PhysicalLocation, length: u64) -> Self {
        Self {
            location,
            length,
            is_dir: false,
            read_only: false,
            reservation: None,
        }
    }

    pub const fn dir() -> Self {
        Self {
            location: PhysicalLocation::Missing,
            length: 0,
            is_dir: true,
            read_only: false,
            reservation: None,
        }
    }

    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Memory the entry keeps accounted until it is dropped
    #[must_use]
    pub fn with_reservation(mut self, reservation: Option<MemoryReservation>) -> Self {
        self.reservation = reservation;
        self
    }

    pub fn memory_use(&self) -> u64 {
        self.reservation.as_ref().map_or(0, MemoryReservation::bytes)
    }

    pub const fn exists(&self) -> bool {
        !matches!(self.location, PhysicalLocation::Missing) || self.is_dir
    }
}

#[derive(Debug, Default)]
pub struct EntryTable {
    entries: BTreeMap<String, Entry>,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Entry> {
        self.entries.get_mut(path)
    }

    /// Insert `entry` at `path`, materializing its ancestor directories
    pub fn insert(&mut self, path: &str, entry: Entry) -> Option<Entry> {
        for dir in ancestors(path) {
            self.entries
                .entry(dir.to_string())
                .or_insert_with(Entry::dir);
        }
        self.entries.insert(path.to_string(), entry)
    }

    pub fn add_dir(&mut self, path: &str) {
        if path.is_empty() {
            return;
        }
        if !self.entries.contains_key(path) {
            self.insert(path, Entry::dir());
        }
    }

    /// Whether the path names an existing file or directory
    pub fn exists(&self, path: &str) -> bool {
        path.is_empty() || self.entries.get(path).is_some_and(Entry::exists)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        path.is_empty() || self.entries.get(path).is_some_and(|e| e.is_dir)
    }

    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(path)
    }

    /// Remove `dir` and everything below it
    pub fn remove_dir(&mut self, dir: &str) -> Vec<(String, Entry)> {
        let below: Vec<String> = self.under(dir).map(|(path, _)| path.clone()).collect();
        let mut removed: Vec<(String, Entry)> = below
            .into_iter()
            .filter_map(|path| self.entries.remove(&path).map(|e| (path, e)))
            .collect();
        if let Some(entry) = self.entries.remove(dir) {
            removed.push((dir.to_string(), entry));
        }
        removed
    }

    /// Entries strictly below `dir`
    pub fn under<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> {
        let start = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        self.entries
            .range(start.clone()..)
            .take_while(move |(path, _)| path.starts_with(&start))
            .filter(move |(path, _)| path.as_str() != dir)
    }

    /// Names below `dir`, relative to it, sorted
    pub fn list(&self, dir: &str, recursive: bool) -> Vec<String> {
        self.under(dir)
            .filter(|(_, entry)| entry.exists())
            .filter_map(|(path, _)| relative_to(dir, path))
            .filter(|rel| recursive || !rel.contains('/'))
            .map(str::to_string)
            .collect()
    }

    /// Snapshot of the selected files and directories for persistence
    ///
    /// Every selected file must be on disk or in a package; directories in
    /// `dirs` contribute all files below them except those below a
    /// `filter_dirs` entry.
    pub fn persist(
        &self,
        root: &Path,
        files: &[String],
        dirs: &[String],
        filter_dirs: &[String],
    ) -> Result<PersistedEntryTable> {
        let filtered = |path: &str| filter_dirs.iter().any(|f| is_sub_path(f, path));
        let mut table = PersistedEntryTable::default();
        let add = |path: &str, entry: &Entry, table: &mut PersistedEntryTable| -> Result<()> {
            if entry.is_dir {
                table.dirs.insert(path.to_string());
                return Ok(());
            }
            let location = match &entry.location {
                PhysicalLocation::Disk { path: physical } => PersistedLocation::Disk {
                    path: relative_physical(root, physical)?,
                },
                PhysicalLocation::Package {
                    data_path,
                    offset,
                    length,
                } => PersistedLocation::Package {
                    data_path: relative_physical(root, data_path)?,
                    offset: *offset,
                    length: *length,
                },
                PhysicalLocation::Mem { .. } | PhysicalLocation::Slice(_) => {
                    return Err(Error::internal(format!(
                        "{path} is still in memory, sync before committing"
                    )));
                }
                PhysicalLocation::Missing => return Ok(()),
            };
            table.files.insert(
                path.to_string(),
                PersistedFile {
                    length: entry.length,
                    location,
                },
            );
            Ok(())
        };

        for path in files {
            let entry = self
                .get(path)
                .ok_or_else(|| Error::not_found(format!("commit file {path}")))?;
            add(path, entry, &mut table)?;
        }
        for dir in dirs {
            let entry = self
                .get(dir)
                .filter(|e| e.is_dir)
                .ok_or_else(|| Error::not_found(format!("commit directory {dir}")))?;
            if !filtered(dir) {
                add(dir, entry, &mut table)?;
            }
            for (path, entry) in self.under(dir) {
                if !filtered(path) {
                    add(path, entry, &mut table)?;
                }
            }
        }
        Ok(table)
    }
}

fn relative_physical(root: &Path, physical: &Path) -> Result<String> {
    physical
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|_| {
            Error::not_supported(format!(
                "{} is outside the physical root {}",
                physical.display(),
                root.display()
            ))
        })
}

/// Physical location as stored in `entry_table.<version>`, relative to the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedLocation {
    Disk {
        path: String,
    },
    Package {
        data_path: String,
        offset: u64,
        length: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedFile {
    pub length: u64,
    #[serde(flatten)]
    pub location: PersistedLocation,
}

/// Content of `entry_table.<version>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntryTable {
    pub files: BTreeMap<String, PersistedFile>,
    pub dirs: BTreeSet<String>,
}

impl PersistedEntryTable {
    /// Read the entry table of `version` under `root`
    pub fn load(root: &Path, version: u64) -> Result<Self> {
        let path = root.join(entry_table_file(version));
        let data = fs::read(&path).map_err(|e| Error::io(path.to_string_lossy(), e))?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Serialization(format!("{}: {e}", path.display())))
    }

    pub fn store(&self, root: &Path, version: u64) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Serialization(format!("entry table: {e}")))?;
        dump_file(&root.join(entry_table_file(version)), &data)
    }

    /// Entries rebased under `logical` with absolute physical paths
    pub fn resolve<'a>(
        &'a self,
        root: &'a Path,
        logical: &'a str,
    ) -> impl Iterator<Item = (String, Entry)> + 'a {
        let dirs = self
            .dirs
            .iter()
            .map(move |dir| (join_path(logical, dir), Entry::dir().read_only(true)));
        let files = self.files.iter().map(move |(path, file)| {
            let location = match &file.location {
                PersistedLocation::Disk { path } => PhysicalLocation::Disk {
                    path: root.join(path),
                },
                PersistedLocation::Package {
                    data_path,
                    offset,
                    length,
                } => PhysicalLocation::Package {
                    data_path: root.join(data_path),
                    offset: *offset,
                    length: *length,
                },
            };
            (
                join_path(logical, path),
                Entry::file(location, file.length).read_only(true),
            )
        });
        dirs.chain(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(path: &str) -> Entry {
        Entry::file(
            PhysicalLocation::Disk {
                path: PathBuf::from("/data").join(path),
            },
            1,
        )
    }

    #[test]
    fn test_implied_directories_and_listing() {
        let mut table = EntryTable::new();
        table.insert("seg_0/attr/data", disk("seg_0/attr/data"));
        table.insert("seg_0/meta", disk("seg_0/meta"));
        table.add_dir("seg_1");

        assert!(table.is_dir("seg_0"));
        assert!(table.is_dir("seg_0/attr"));
        assert!(!table.is_dir("seg_0/meta"));
        assert_eq!(table.list("", false), vec!["seg_0", "seg_1"]);
        assert_eq!(table.list("seg_0", false), vec!["attr", "meta"]);
        assert_eq!(
            table.list("seg_0", true),
            vec!["attr", "attr/data", "meta"]
        );
    }

    #[test]
    fn test_remove_dir_is_recursive() {
        let mut table = EntryTable::new();
        table.insert("a/b/c", disk("a/b/c"));
        table.insert("a/d", disk("a/d"));
        table.insert("ab", disk("ab"));
        let removed = table.remove_dir("a");
        assert_eq!(removed.len(), 4);
        assert!(table.list("", true) == vec!["ab"]);
    }

    #[test]
    fn test_missing_entries_do_not_exist() {
        let mut table = EntryTable::new();
        table.insert("opt", Entry::file(PhysicalLocation::Missing, 0));
        assert!(!table.exists("opt"));
        assert!(table.list("", false).is_empty());
    }

    #[test]
    fn test_persist_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let mut table = EntryTable::new();
        table.insert(
            "seg_0/data",
            Entry::file(
                PhysicalLocation::Disk {
                    path: root.join("seg_0/data"),
                },
                10,
            ),
        );
        table.insert(
            "seg_0/tmp/x",
            Entry::file(
                PhysicalLocation::Disk {
                    path: root.join("seg_0/tmp/x"),
                },
                1,
            ),
        );
        table.insert(
            "seg_0/pkg/f",
            Entry::file(
                PhysicalLocation::Package {
                    data_path: root.join("seg_0/pkg/package_file.__data__0"),
                    offset: 4,
                    length: 3,
                },
                3,
            ),
        );
        table.insert(
            "version.1",
            Entry::file(
                PhysicalLocation::Disk {
                    path: root.join("version.1"),
                },
                2,
            ),
        );

        let persisted = table
            .persist(
                root,
                &["version.1".to_string()],
                &["seg_0".to_string()],
                &["seg_0/tmp".to_string()],
            )
            .unwrap();
        assert!(persisted.files.contains_key("seg_0/data"));
        assert!(persisted.files.contains_key("seg_0/pkg/f"));
        assert!(!persisted.files.contains_key("seg_0/tmp/x"));
        assert!(persisted.dirs.contains("seg_0"));

        persisted.store(root, 1).unwrap();
        let loaded = PersistedEntryTable::load(root, 1).unwrap();
        assert_eq!(loaded, persisted);

        let resolved: BTreeMap<String, Entry> = loaded.resolve(root, "p0").collect();
        let entry = &resolved["p0/seg_0/pkg/f"];
        assert!(entry.read_only);
        assert!(matches!(
            &entry.location,
            PhysicalLocation::Package { offset: 4, length: 3, .. }
        ));
        assert!(PersistedEntryTable::load(root, 2).unwrap_err().is_not_found());
    }

    #[test]
    fn test_persist_rejects_mem_entries() {
        let mut table = EntryTable::new();
        table.insert(
            "f",
            Entry::file(
                PhysicalLocation::Mem {
                    data: Bytes::from_static(b"x"),
                },
                1,
            ),
        );
        let err = table
            .persist(Path::new("/data"), &["f".to_string()], &[], &[])
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
