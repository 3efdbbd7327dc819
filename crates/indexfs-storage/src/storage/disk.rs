//! Disk file writer

use super::{CloseHook, ClosedContent, ClosedFile};
use crate::layout::TEMP_FILE_MARKER;
use crate::writer::FileWriter;
use indexfs_common::{Error, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Writes straight to a local file
///
/// With `atomic_dump` the bytes go to a temp file next to the target and
/// the temp file is renamed over the target on close, so a crash never
/// leaves a partially written target behind.
#[derive(Debug)]
pub struct DiskFileWriter {
    logical_path: String,
    target: PathBuf,
    writing: PathBuf,
    file: Option<BufWriter<File>>,
    length: u64,
    sync_on_close: bool,
    hook: Option<CloseHook>,
}

impl DiskFileWriter {
    pub fn create(
        logical_path: impl Into<String>,
        target: impl Into<PathBuf>,
        atomic_dump: bool,
        sync_on_close: bool,
        hook: CloseHook,
    ) -> Result<Self> {
        let logical_path = logical_path.into();
        let target = target.into();
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent.to_string_lossy(), e))?;
        }
        let writing = if atomic_dump {
            temp_path(&target)
        } else {
            target.clone()
        };
        let file = File::create(&writing).map_err(|e| Error::io(writing.to_string_lossy(), e))?;
        Ok(Self {
            logical_path,
            target,
            writing,
            file: Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
            length: 0,
            sync_on_close,
            hook: Some(hook),
        })
    }

    fn io_err(&self, e: std::io::Error) -> Error {
        Error::io(self.writing.to_string_lossy(), e)
    }
}

/// Temp file name used for atomic writes of `target`
pub fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!("{TEMP_FILE_MARKER}{}", uuid::Uuid::new_v4().simple()));
    target.with_file_name(name)
}

/// Write `data` to `target` through a synced temp file and a rename
pub fn dump_file(target: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent.to_string_lossy(), e))?;
    }
    let temp = temp_path(target);
    let result = (|| {
        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, target)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(Error::io(target.to_string_lossy(), e));
    }
    Ok(())
}

impl FileWriter for DiskFileWriter {
    fn logical_path(&self) -> &str {
        &self.logical_path
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::internal(format!("{} already closed", self.logical_path)));
        };
        if let Err(e) = file.write_all(data) {
            return Err(self.io_err(e));
        }
        self.length += data.len() as u64;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn close(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let file = file.into_inner().map_err(|e| self.io_err(e.into_error()))?;
        if self.sync_on_close {
            file.sync_all().map_err(|e| self.io_err(e))?;
        }
        drop(file);
        if self.writing != self.target {
            fs::rename(&self.writing, &self.target).map_err(|e| self.io_err(e))?;
        }
        if let Some(hook) = self.hook.take() {
            hook.call(ClosedFile {
                logical_path: self.logical_path.clone(),
                length: self.length,
                content: ClosedContent::Disk {
                    physical_path: self.target.clone(),
                },
            })?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

impl Drop for DiskFileWriter {
    fn drop(&mut self) {
        // An abandoned atomic write leaves no temp file behind
        if self.file.take().is_some() && self.writing != self.target {
            let _ = fs::remove_file(&self.writing);
        }
    }
}
