//! Config downloader
//!
//! Brings a remote config directory (or file) into a local directory
//! before a file system opens it. The copy goes to a temp name and is
//! renamed into place, so a local path either holds a complete copy or
//! nothing. Transient failures are retried a bounded number of times with
//! a fixed interval; local disk failures are reported at once.

use crate::layout::TEMP_FILE_MARKER;
use indexfs_common::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadErrorCode {
    /// The local copy is complete
    None,
    /// Source unreadable or retries exhausted
    NormalError,
    /// The local disk refused the copy (permission, no space)
    DestError,
}

#[derive(Debug, Clone)]
pub struct ConfigDownloader {
    retry_times: u32,
    retry_interval: Duration,
}

impl Default for ConfigDownloader {
    fn default() -> Self {
        Self {
            retry_times: 3,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl ConfigDownloader {
    pub const fn new(retry_times: u32, retry_interval: Duration) -> Self {
        Self {
            retry_times,
            retry_interval,
        }
    }

    /// Local path `remote` is downloaded to
    pub fn local_target(remote: &Path, local_dir: &Path) -> Result<PathBuf> {
        let name = remote.file_name().ok_or_else(|| {
            Error::bad_parameter(format!("{} has no last component", remote.display()))
        })?;
        Ok(local_dir.join(name))
    }

    /// Make `local_dir/<last component of remote>` a complete copy of `remote`
    pub fn download_config(&self, remote: &Path, local_dir: &Path) -> DownloadErrorCode {
        let target = match Self::local_target(remote, local_dir) {
            Ok(target) => target,
            Err(e) => {
                warn!("Cannot download {}: {}", remote.display(), e);
                return DownloadErrorCode::NormalError;
            }
        };
        if target.exists() {
            return DownloadErrorCode::None;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::download_once(remote, &target) {
                Ok(()) => {
                    info!("Downloaded {} to {}", remote.display(), target.display());
                    return DownloadErrorCode::None;
                }
                Err(DownloadError::Dest(e)) => {
                    warn!("Local disk refused {}: {}", target.display(), e);
                    return DownloadErrorCode::DestError;
                }
                Err(DownloadError::Source(e)) if attempt > self.retry_times => {
                    warn!(
                        "Giving up on {} after {} attempts: {}",
                        remote.display(),
                        attempt,
                        e
                    );
                    return DownloadErrorCode::NormalError;
                }
                Err(DownloadError::Source(e)) => {
                    warn!(
                        "Download of {} failed (attempt {}): {}",
                        remote.display(),
                        attempt,
                        e
                    );
                    std::thread::sleep(self.retry_interval);
                }
            }
        }
    }

    fn download_once(remote: &Path, target: &Path) -> std::result::Result<(), DownloadError> {
        let mut temp_name = target.file_name().unwrap_or_default().to_os_string();
        temp_name.push(format!("{TEMP_FILE_MARKER}{}", uuid::Uuid::new_v4().simple()));
        let temp = target.with_file_name(temp_name);

        let result = copy_tree(remote, &temp).and_then(|()| {
            fs::rename(&temp, target)
                .map_err(|e| DownloadError::classify(Error::io(target.to_string_lossy(), e)))
        });
        if result.is_err() {
            let _ = fs::remove_dir_all(&temp);
            let _ = fs::remove_file(&temp);
        }
        result
    }
}

#[derive(Debug)]
enum DownloadError {
    Source(Error),
    Dest(Error),
}

impl DownloadError {
    fn classify(e: Error) -> Self {
        if e.is_local_disk_error() {
            Self::Dest(e)
        } else {
            Self::Source(e)
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::result::Result<(), DownloadError> {
    let source_err = |e| DownloadError::Source(Error::io(src.to_string_lossy(), e));
    let dest_err = |e| DownloadError::classify(Error::io(dst.to_string_lossy(), e));

    let meta = fs::metadata(src).map_err(source_err)?;
    if meta.is_dir() {
        fs::create_dir_all(dst).map_err(dest_err)?;
        for item in fs::read_dir(src).map_err(source_err)? {
            let item = item.map_err(source_err)?;
            copy_tree(&item.path(), &dst.join(item.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(dest_err)?;
        }
        fs::copy(src, dst).map_err(dest_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_directory() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let config = remote.path().join("config_v1");
        fs::create_dir_all(config.join("schemas")).unwrap();
        fs::write(config.join("schemas/main.json"), b"{}").unwrap();
        fs::write(config.join("load_config.json"), b"{\"load_config\":[]}").unwrap();

        let downloader = ConfigDownloader::new(0, Duration::ZERO);
        assert_eq!(
            downloader.download_config(&config, local.path()),
            DownloadErrorCode::None
        );
        let target = local.path().join("config_v1");
        assert_eq!(fs::read(target.join("schemas/main.json")).unwrap(), b"{}");

        // Present copies are left alone
        fs::write(config.join("load_config.json"), b"changed").unwrap();
        assert_eq!(
            downloader.download_config(&config, local.path()),
            DownloadErrorCode::None
        );
        assert_eq!(
            fs::read(target.join("load_config.json")).unwrap(),
            b"{\"load_config\":[]}"
        );
        let leftovers = fs::read_dir(local.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains(TEMP_FILE_MARKER)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_missing_source_exhausts_retries() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let downloader = ConfigDownloader::new(2, Duration::from_millis(1));
        assert_eq!(
            downloader.download_config(&remote.path().join("absent"), local.path()),
            DownloadErrorCode::NormalError
        );
        assert!(!local.path().join("absent").exists());
    }

    #[test]
    fn test_single_file_download() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let file = remote.path().join("cluster.json");
        fs::write(&file, b"cluster").unwrap();
        let downloader = ConfigDownloader::default();
        assert_eq!(
            downloader.download_config(&file, &local.path().join("nested")),
            DownloadErrorCode::None
        );
        assert_eq!(
            fs::read(local.path().join("nested/cluster.json")).unwrap(),
            b"cluster"
        );
    }
}
