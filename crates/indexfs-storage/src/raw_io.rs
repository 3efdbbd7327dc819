//! Positional file reads, optionally bypassing the page cache
//!
//! Block and buffered file nodes read through [`RawFile`]. Reads use
//! `pread`, so one handle is shared by any number of concurrent readers
//! without a cursor. With `direct_io` the file is opened with `O_DIRECT`
//! on Linux and every read goes through an [`AlignedBuffer`].

use crate::layout::{ALIGNMENT, align_down, align_up};
use indexfs_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Read-only file handle with positional reads
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    direct_io: bool,
}

impl RawFile {
    /// Open a file for reading
    ///
    /// When `direct_io` is requested but the file system refuses `O_DIRECT`
    /// (tmpfs, some overlays) the file is opened buffered instead.
    pub fn open(path: impl AsRef<Path>, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let (file, direct_io) = if direct_io {
            match Self::open_direct(path.as_ref()) {
                Ok(file) => (file, true),
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    tracing::warn!(
                        "O_DIRECT not supported for {}, falling back to buffered reads",
                        path_str
                    );
                    (File::open(&path).map_err(|e| Error::io(&path_str, e))?, false)
                }
                Err(e) => return Err(Error::io(path_str, e)),
            }
        } else {
            (File::open(&path).map_err(|e| Error::io(&path_str, e))?, false)
        };

        let size = file
            .metadata()
            .map_err(|e| Error::io(&path_str, e))?
            .len();

        Ok(Self {
            file,
            path: path_str,
            size,
            direct_io,
        })
    }

    #[cfg(target_os = "linux")]
    fn open_direct(path: &Path) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
    }

    #[cfg(not(target_os = "linux"))]
    fn open_direct(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().read(true).open(path)
    }

    /// File size at open time
    pub const fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub const fn is_direct_io(&self) -> bool {
        self.direct_io
    }

    /// Read up to `buf.len()` bytes at `offset`, returning the bytes read
    ///
    /// Short reads only happen at end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(usize::try_from(self.size - offset).unwrap_or(usize::MAX));
        if self.direct_io {
            self.read_aligned(offset, &mut buf[..len])
        } else {
            self.read_exact_at(offset, &mut buf[..len])?;
            Ok(len)
        }
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::io(&self.path, e))
    }

    fn read_aligned(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let start = align_down(offset);
        let end = align_up(offset + buf.len() as u64);
        #[allow(clippy::cast_possible_truncation)]
        let mut aligned = AlignedBuffer::new((end - start) as usize);

        let mut filled = 0usize;
        let target = aligned.len();
        while filled < target {
            let n = self
                .file
                .read_at(&mut aligned.as_mut_slice()[filled..], start + filled as u64)
                .map_err(|e| Error::io(&self.path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        #[allow(clippy::cast_possible_truncation)]
        let skip = (offset - start) as usize;
        let available = filled.saturating_sub(skip).min(buf.len());
        buf[..available].copy_from_slice(&aligned.as_slice()[skip..skip + available]);
        if available < buf.len() {
            return Err(Error::corruption(format!(
                "{}: short direct read at {}, got {} of {} bytes",
                self.path,
                offset,
                available,
                buf.len()
            )));
        }
        Ok(available)
    }
}

/// Buffer whose data starts at an [`ALIGNMENT`] boundary
///
/// Over-allocates a plain `Vec` and exposes the aligned window inside it.
#[derive(Debug)]
pub struct AlignedBuffer {
    data: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Zeroed buffer of `size` rounded up to the alignment
    #[must_use]
    pub fn new(size: usize) -> Self {
        let len = size.div_ceil(ALIGNMENT) * ALIGNMENT;
        let data = vec![0u8; len + ALIGNMENT];
        let start = data.as_ptr().align_offset(ALIGNMENT);
        Self { data, start, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.len]
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}
