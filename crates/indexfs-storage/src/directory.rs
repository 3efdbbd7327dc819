//! Directory facade
//!
//! A [`Directory`] resolves relative paths against its logical root and
//! delegates to the bound [`LogicalFileSystem`]. [`ReadOnlyDirectory`]
//! wraps one and only exposes the read side, which is how link
//! directories over flushed segments are handed out.

use crate::file_system::{DirectoryOption, LogicalFileSystem, RemoveOption};
use crate::flush::SyncFuture;
use crate::path::{join_path, normalize_path};
use crate::reader::{FileReader, ReaderOption};
use crate::slice::SliceFile;
use crate::writer::{FileWriter, WriterOption};
use indexfs_common::{Error, FsStorageType, Result};
use std::sync::Arc;

/// Where a directory's new files land
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    /// Follow the file system's output storage
    Local,
    /// Always in memory, flushed by `sync`
    Mem,
}

#[derive(Debug, Clone)]
pub struct Directory {
    fs: Arc<LogicalFileSystem>,
    root: String,
    kind: DirectoryKind,
}

impl Directory {
    /// Directory over `root`; the root itself must exist
    pub fn new(fs: Arc<LogicalFileSystem>, root: &str) -> Result<Self> {
        Self::open(fs, root, DirectoryKind::Local)
    }

    pub fn mem(fs: Arc<LogicalFileSystem>, root: &str) -> Result<Self> {
        Self::open(fs, root, DirectoryKind::Mem)
    }

    fn open(fs: Arc<LogicalFileSystem>, root: &str, kind: DirectoryKind) -> Result<Self> {
        let root = normalize_path(root)?;
        if !fs.is_dir(&root)? {
            return Err(Error::not_found(format!("directory {root}")));
        }
        Ok(Self { fs, root, kind })
    }

    pub fn logical_path(&self) -> &str {
        &self.root
    }

    pub const fn kind(&self) -> DirectoryKind {
        self.kind
    }

    pub fn file_system(&self) -> &Arc<LogicalFileSystem> {
        &self.fs
    }

    fn resolve(&self, path: &str) -> Result<String> {
        Ok(join_path(&self.root, &normalize_path(path)?))
    }

    pub fn create_file_writer(
        &self,
        path: &str,
        option: &WriterOption,
    ) -> Result<Box<dyn FileWriter>> {
        let path = self.resolve(path)?;
        if self.kind == DirectoryKind::Mem && option.storage.is_none() {
            let option = option.clone().with_storage(FsStorageType::Mem);
            return self.fs.create_file_writer(&path, &option);
        }
        self.fs.create_file_writer(&path, option)
    }

    pub fn create_file_reader(&self, path: &str, option: ReaderOption) -> Result<FileReader> {
        self.fs.create_file_reader(&self.resolve(path)?, option)
    }

    /// Create a subdirectory of the same kind
    pub fn make_directory(&self, path: &str, option: DirectoryOption) -> Result<Self> {
        let path = self.resolve(path)?;
        self.fs.make_directory(&path, option)?;
        Ok(Self {
            fs: Arc::clone(&self.fs),
            root: path,
            kind: self.kind,
        })
    }

    pub fn get_directory(&self, path: &str) -> Result<Self> {
        Self::open(Arc::clone(&self.fs), &self.resolve(path)?, self.kind)
    }

    pub fn remove_file(&self, path: &str, option: RemoveOption) -> Result<()> {
        self.fs.remove_file(&self.resolve(path)?, option)
    }

    pub fn remove_directory(&self, path: &str, option: RemoveOption) -> Result<()> {
        self.fs.remove_directory(&self.resolve(path)?, option)
    }

    pub fn is_exist(&self, path: &str) -> Result<bool> {
        self.fs.is_exist(&self.resolve(path)?)
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        self.fs.is_dir(&self.resolve(path)?)
    }

    pub fn list_dir(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        self.fs.list_dir(&self.resolve(path)?, recursive)
    }

    pub fn get_file_length(&self, path: &str) -> Result<u64> {
        self.fs.get_file_length(&self.resolve(path)?)
    }

    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.fs.rename(&self.resolve(src)?, &self.resolve(dst)?)
    }

    pub fn create_slice_file(
        &self,
        path: &str,
        slice_len: u64,
        slice_num: u64,
    ) -> Result<Arc<SliceFile>> {
        self.fs
            .create_slice_file(&self.resolve(path)?, slice_len, slice_num)
    }

    pub fn sync(&self, wait_finish: bool) -> Result<SyncFuture> {
        self.fs.sync(wait_finish)
    }

    /// Read-only snapshot of the flushed files below this directory
    pub fn link(&self) -> Result<ReadOnlyDirectory> {
        let link = self.fs.create_root_link(&self.root)?;
        Ok(ReadOnlyDirectory {
            inner: Self::open(Arc::clone(&self.fs), &link, DirectoryKind::Local)?,
        })
    }

    /// Read-only view of this directory
    pub fn read_only(&self) -> ReadOnlyDirectory {
        ReadOnlyDirectory {
            inner: self.clone(),
        }
    }
}

/// Directory without writers, removals or subdirectory creation
///
/// Slice files are the one writable thing: they are pool-backed and never
/// reach the flushed data the view is over.
#[derive(Debug, Clone)]
pub struct ReadOnlyDirectory {
    inner: Directory,
}

impl ReadOnlyDirectory {
    pub fn logical_path(&self) -> &str {
        self.inner.logical_path()
    }

    pub fn create_file_reader(&self, path: &str, option: ReaderOption) -> Result<FileReader> {
        self.inner.create_file_reader(path, option)
    }

    pub fn get_directory(&self, path: &str) -> Result<Self> {
        Ok(Self {
            inner: self.inner.get_directory(path)?,
        })
    }

    pub fn is_exist(&self, path: &str) -> Result<bool> {
        self.inner.is_exist(path)
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        self.inner.is_dir(path)
    }

    pub fn list_dir(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        self.inner.list_dir(path, recursive)
    }

    pub fn get_file_length(&self, path: &str) -> Result<u64> {
        self.inner.get_file_length(path)
    }

    pub fn create_slice_file(
        &self,
        path: &str,
        slice_len: u64,
        slice_num: u64,
    ) -> Result<Arc<SliceFile>> {
        self.inner.create_slice_file(path, slice_len, slice_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_system::FileSystemOptions;
    use indexfs_common::{FileSystemConfig, FsOpenType};

    fn setup(config: FileSystemConfig) -> (tempfile::TempDir, Directory) {
        let dir = tempfile::tempdir().unwrap();
        let fs = LogicalFileSystem::create(
            "test",
            dir.path(),
            FileSystemOptions {
                config,
                ..FileSystemOptions::default()
            },
        )
        .unwrap();
        let root = Directory::new(Arc::new(fs), "").unwrap();
        (dir, root)
    }

    fn write(dir: &Directory, path: &str, data: &[u8]) {
        let mut writer = dir.create_file_writer(path, &WriterOption::new()).unwrap();
        writer.write(data).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_relative_paths_resolve_under_root() {
        let (tmp, root) = setup(FileSystemConfig::default());
        let seg = root
            .make_directory("segment_0_level_0", DirectoryOption::default())
            .unwrap();
        write(&seg, "attr/data", b"attribute");

        assert!(root.is_exist("segment_0_level_0/attr/data").unwrap());
        assert!(tmp.path().join("segment_0_level_0/attr/data").is_file());
        assert_eq!(seg.list_dir("", true).unwrap(), vec!["attr", "attr/data"]);
        assert_eq!(seg.get_file_length("attr/data").unwrap(), 9);

        let attr = seg.get_directory("attr").unwrap();
        assert_eq!(attr.logical_path(), "segment_0_level_0/attr");
        let reader = attr
            .create_file_reader("data", ReaderOption::new(FsOpenType::Mem))
            .unwrap();
        assert_eq!(reader.read_all().unwrap(), &b"attribute"[..]);
        assert!(matches!(seg.get_directory("nope"), Err(Error::NotFound(_))));
        assert!(matches!(
            root.make_directory("a/b", DirectoryOption::default()),
            Err(Error::NotFound(_))
        ));

        seg.rename("attr/data", "attr/moved").unwrap();
        assert!(!seg.is_exist("attr/data").unwrap());
        seg.remove_directory("attr", RemoveOption::default()).unwrap();
        assert!(seg.list_dir("", true).unwrap().is_empty());
    }

    #[test]
    fn test_mem_directory_keeps_files_in_memory() {
        let (tmp, root) = setup(FileSystemConfig::default());
        let building = Directory::mem(Arc::clone(root.file_system()), "").unwrap();
        let rt = building
            .make_directory("rt", DirectoryOption::recursive())
            .unwrap();
        assert_eq!(rt.kind(), DirectoryKind::Mem);
        write(&rt, "doc", b"realtime");
        assert!(!tmp.path().join("rt/doc").exists());

        rt.sync(true).unwrap().wait().unwrap();
        assert!(tmp.path().join("rt/doc").is_file());
    }

    #[test]
    fn test_link_directory_is_read_only_snapshot() {
        let (_tmp, root) = setup(FileSystemConfig::default());
        let rt = root.make_directory("rt", DirectoryOption::default()).unwrap();
        write(&rt, "flushed", b"on disk");

        let link = rt.link().unwrap();
        write(&rt, "later", b"after link");
        assert!(link.is_exist("flushed").unwrap());
        assert!(!link.is_exist("later").unwrap());
        assert_eq!(link.list_dir("", false).unwrap(), vec!["flushed"]);

        let reader = link
            .create_file_reader("flushed", ReaderOption::load_config())
            .unwrap();
        assert_eq!(reader.read_all().unwrap(), &b"on disk"[..]);

        let slice = link.create_slice_file("scratch", 8, 2).unwrap();
        slice.append(b"ok").unwrap();
        assert_eq!(link.get_file_length("scratch").unwrap(), 2);

        let view = rt.read_only();
        assert!(view.is_exist("later").unwrap());
    }
}
