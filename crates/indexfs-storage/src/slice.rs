//! Slice files
//!
//! A slice file is a fixed-capacity in-memory file made of `slice_num`
//! slices of `slice_len` bytes. Its whole capacity is reserved from the
//! memory quota when it is created. Slice files never enter the file node
//! cache; they live until removed from the file system.

use crate::memory::{MemoryQuota, MemoryReservation};
use bytes::Bytes;
use indexfs_common::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug)]
pub struct SliceFile {
    path: String,
    slice_len: u64,
    slice_num: u64,
    data: RwLock<Vec<u8>>,
    _reservation: MemoryReservation,
}

impl SliceFile {
    pub fn new(
        path: impl Into<String>,
        slice_len: u64,
        slice_num: u64,
        quota: &Arc<MemoryQuota>,
    ) -> Result<Self> {
        let path = path.into();
        if slice_len == 0 || slice_num == 0 {
            return Err(Error::bad_parameter(format!(
                "slice file {path}: slice length and count must be positive"
            )));
        }
        let capacity = slice_len
            .checked_mul(slice_num)
            .ok_or_else(|| Error::bad_parameter(format!("slice file {path}: capacity overflow")))?;
        let reservation = quota.reserve(capacity)?;
        Ok(Self {
            path,
            slice_len,
            slice_num,
            data: RwLock::new(Vec::new()),
            _reservation: reservation,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub const fn slice_len(&self) -> u64 {
        self.slice_len
    }

    pub const fn slice_num(&self) -> u64 {
        self.slice_num
    }

    pub const fn capacity(&self) -> u64 {
        self.slice_len * self.slice_num
    }

    pub fn length(&self) -> u64 {
        self.data.read().len() as u64
    }

    /// Number of slices holding data
    pub fn used_slices(&self) -> u64 {
        self.length().div_ceil(self.slice_len)
    }

    /// Append bytes, failing when the capacity would be exceeded
    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let end = data.len() as u64 + bytes.len() as u64;
        if end > self.capacity() {
            return Err(Error::OutOfRange {
                offset: data.len() as u64,
                length: bytes.len() as u64,
                size: self.capacity(),
            });
        }
        data.extend_from_slice(bytes);
        Ok(())
    }

    /// Copy bytes at `offset` into `buf`, returning the count copied
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Bytes> {
        let data = self.data.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.checked_add(len).filter(|end| *end <= data.len());
        match end {
            Some(end) => Ok(Bytes::copy_from_slice(&data[start..end])),
            None => Err(Error::OutOfRange {
                offset,
                length: len as u64,
                size: data.len() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read() {
        let quota = Arc::new(MemoryQuota::unlimited());
        let slice = SliceFile::new("rt/slice", 4, 3, &quota).unwrap();
        assert_eq!(quota.used(), 12);
        slice.append(b"hello").unwrap();
        slice.append(b" world!").unwrap();
        assert_eq!(slice.used_slices(), 3);
        assert_eq!(slice.read_bytes(6, 5).unwrap(), Bytes::from_static(b"world"));
        assert!(slice.append(b"x").is_err());

        let mut buf = [0u8; 8];
        assert_eq!(slice.read(&mut buf, 10).unwrap(), 2);
        assert_eq!(&buf[..2], b"d!");
    }

    #[test]
    fn test_quota_reserved_up_front() {
        let quota = Arc::new(MemoryQuota::new(100));
        let _a = SliceFile::new("a", 10, 8, &quota).unwrap();
        assert!(SliceFile::new("b", 10, 3, &quota).is_err());
        assert!(SliceFile::new("c", 0, 3, &quota).is_err());
    }
}
