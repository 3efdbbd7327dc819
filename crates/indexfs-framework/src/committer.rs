//! Version commit
//!
//! Publishes a version through the file system's selective commit: the
//! segment directories of the version become the committed directory set
//! and the version file is the final marker, written last.

use crate::retry::RetryPolicy;
use crate::version::Version;
use indexfs_common::Result;
use indexfs_storage::path::join_path;
use indexfs_storage::{FenceContext, LogicalFileSystem};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct VersionCommitter {
    retry: RetryPolicy,
    /// Files outside the segments committed with every version
    extra_files: Vec<String>,
    /// Subdirectories of segments left out of the commit
    filter_dirs: Vec<String>,
}

impl VersionCommitter {
    pub const fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            extra_files: Vec::new(),
            filter_dirs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_extra_file(mut self, path: impl Into<String>) -> Self {
        self.extra_files.push(path.into());
        self
    }

    #[must_use]
    pub fn with_filter_dir(mut self, path: impl Into<String>) -> Self {
        self.filter_dirs.push(path.into());
        self
    }

    /// Commit `version` below the logical directory `root`
    ///
    /// Paths given to `with_extra_file` and `with_filter_dir` are relative
    /// to `root`. With a fence the version records its token and the
    /// commit fails once another attempt took the fence over.
    pub fn commit(
        &self,
        fs: &LogicalFileSystem,
        root: &str,
        version: &Version,
        fence: Option<&FenceContext>,
    ) -> Result<()> {
        let mut version = version.clone();
        if let Some(fence) = fence {
            version.set_fence_name(fence.token());
        }
        let content = version.to_json()?;
        let final_name = join_path(root, &version.file_name());
        let dirs: Vec<String> = version
            .segment_directory_names()
            .iter()
            .map(|name| join_path(root, name))
            .collect();
        let files: Vec<String> = self.extra_files.iter().map(|f| join_path(root, f)).collect();
        let filter_dirs: Vec<String> = self.filter_dirs.iter().map(|d| join_path(root, d)).collect();

        let version_id = version.version_id();
        self.retry.run(&format!("commit of version {version_id}"), || {
            fs.commit_selected_files_and_dir(
                version_id.as_u64(),
                &files,
                &dirs,
                &filter_dirs,
                &final_name,
                content.as_bytes(),
                fence,
            )
        })?;
        info!(
            "Committed version {} with {} segments under /{}",
            version_id,
            version.segments().len(),
            root
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{latest_version, list_segment};
    use indexfs_common::{Error, FileSystemConfig, FsOpenType, SegmentId, VersionId};
    use indexfs_storage::{
        Directory, DirectoryOption, FileSystemOptions, MountOption, ReaderOption, WriterOption,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn build_fs(root: &std::path::Path) -> Arc<LogicalFileSystem> {
        let options = FileSystemOptions {
            config: FileSystemConfig::in_memory(),
            ..FileSystemOptions::default()
        };
        Arc::new(LogicalFileSystem::create("build", root, options).unwrap())
    }

    fn write_segment(dir: &Directory, name: &str, data: &[u8]) {
        let seg = dir.make_directory(name, DirectoryOption::recursive()).unwrap();
        let mut writer = seg.create_file_writer("data", &WriterOption::new()).unwrap();
        writer.write(data).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_commit_and_reopen_version() {
        let build = tempfile::tempdir().unwrap();
        let fs = build_fs(build.path());
        let root = Directory::new(Arc::clone(&fs), "").unwrap();
        let mut version = Version::new(VersionId::new(1));
        for (id, data) in [(0u64, &b"zero"[..]), (4, &b"four"[..])] {
            let name = format!("segment_{id}_level_0");
            write_segment(&root, &name, data);
            version.add_segment(SegmentId::new(id), 0).unwrap();
        }
        write_segment(&root, "segment_9_level_0", b"not in the version");

        VersionCommitter::default()
            .commit(&fs, "", &version, None)
            .unwrap();
        assert_eq!(
            Version::load(build.path(), VersionId::new(1)).unwrap(),
            version
        );

        let online = tempfile::tempdir().unwrap();
        let reader_fs =
            LogicalFileSystem::create("online", online.path(), FileSystemOptions::default())
                .unwrap();
        reader_fs
            .mount_version(build.path(), 1, "index", MountOption::default(), &BTreeMap::new())
            .unwrap();
        let index = Directory::new(Arc::new(reader_fs), "index").unwrap();
        assert_eq!(
            list_segment(&index).unwrap(),
            vec!["segment_0_level_0", "segment_4_level_0"]
        );
        assert_eq!(latest_version(&index).unwrap(), Some(VersionId::new(1)));
        let reader = index
            .create_file_reader("segment_4_level_0/data", ReaderOption::new(FsOpenType::Mem))
            .unwrap();
        assert_eq!(reader.read_all().unwrap(), &b"four"[..]);
    }

    #[test]
    fn test_retried_build_fences_out_first_attempt() {
        let build = tempfile::tempdir().unwrap();
        let fs = build_fs(build.path());
        let root = Directory::new(Arc::clone(&fs), "").unwrap();
        write_segment(&root, "segment_0_level_0", b"data");
        let mut version = Version::new(VersionId::new(2));
        version.add_segment(SegmentId::new(0), 0).unwrap();

        let first = FenceContext::acquire(build.path()).unwrap();
        let retry = FenceContext::acquire(build.path()).unwrap();
        let committer = VersionCommitter::new(RetryPolicy::new(3, std::time::Duration::ZERO));
        let err = committer.commit(&fs, "", &version, Some(&first)).unwrap_err();
        assert!(matches!(err, Error::Fenced { .. }));
        assert!(!build.path().join("version.2").exists());

        committer.commit(&fs, "", &version, Some(&retry)).unwrap();
        let stored = Version::load(build.path(), VersionId::new(2)).unwrap();
        assert_eq!(stored.fence_name(), Some(retry.token()));
    }
}
