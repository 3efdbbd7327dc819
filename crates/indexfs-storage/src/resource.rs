//! Typed in-memory resources attached to a file system
//!
//! A resource is any shared object published under a logical name, for
//! example the address mapper of a compressed file loaded once and reused
//! by every reader of that file.

use crate::memory::{MemoryQuota, MemoryReservation};
use indexfs_common::Result;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Named shared value with its memory accounted against the quota
pub struct ResourceFile {
    name: String,
    value: Arc<dyn Any + Send + Sync>,
    reservation: MemoryReservation,
}

impl fmt::Debug for ResourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceFile")
            .field("name", &self.name)
            .field("memory_use", &self.reservation.bytes())
            .finish_non_exhaustive()
    }
}

impl ResourceFile {
    /// Publish `value`, reserving `memory_use` bytes
    pub fn new<T: Any + Send + Sync>(
        name: impl Into<String>,
        value: T,
        memory_use: u64,
        quota: &Arc<MemoryQuota>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            value: Arc::new(value),
            reservation: quota.reserve(memory_use)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn memory_use(&self) -> u64 {
        self.reservation.bytes()
    }

    /// The value, when it has type `T`
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let quota = Arc::new(MemoryQuota::new(1024));
        let resource = ResourceFile::new("seg/mapper", vec![1u64, 2, 3], 24, &quota).unwrap();
        assert_eq!(resource.get::<Vec<u64>>().unwrap().len(), 3);
        assert!(resource.get::<String>().is_none());
        assert_eq!(quota.used(), 24);
        drop(resource);
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn test_quota_exceeded() {
        let quota = Arc::new(MemoryQuota::new(10));
        assert!(ResourceFile::new("big", 0u8, 11, &quota).is_err());
    }
}
