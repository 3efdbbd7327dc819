//! Memory quota accounting
//!
//! Mem-storage files, slice files, resource files and block caches reserve
//! their bytes from one [`MemoryQuota`] per file system. A limit of 0 means
//! unlimited; usage is still tracked for metrics.

use indexfs_common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared byte budget
#[derive(Debug)]
pub struct MemoryQuota {
    limit: u64,
    used: AtomicU64,
}

impl MemoryQuota {
    #[must_use]
    pub const fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn unlimited() -> Self {
        Self::new(0)
    }

    /// Reserve `bytes`, failing when the limit would be exceeded
    pub fn allocate(&self, bytes: u64) -> Result<()> {
        if self.limit == 0 {
            self.used.fetch_add(bytes, Ordering::Relaxed);
            return Ok(());
        }
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.limit {
                return Err(Error::QuotaExceeded {
                    requested: bytes,
                    available: self.limit.saturating_sub(current),
                });
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `bytes` to the budget
    pub fn free(&self, bytes: u64) {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes still available, `u64::MAX` when unlimited
    pub fn available(&self) -> u64 {
        if self.limit == 0 {
            u64::MAX
        } else {
            self.limit.saturating_sub(self.used())
        }
    }

    /// Reserve `bytes` and tie them to the returned guard
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Result<MemoryReservation> {
        self.allocate(bytes)?;
        Ok(MemoryReservation {
            quota: Arc::clone(self),
            bytes,
        })
    }
}

impl Default for MemoryQuota {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Bytes held against a [`MemoryQuota`], released on drop
#[derive(Debug)]
pub struct MemoryReservation {
    quota: Arc<MemoryQuota>,
    bytes: u64,
}

impl MemoryReservation {
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Grow the reservation by `extra` bytes
    pub fn grow(&mut self, extra: u64) -> Result<()> {
        self.quota.allocate(extra)?;
        self.bytes += extra;
        Ok(())
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.quota.free(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_limit() {
        let quota = MemoryQuota::new(100);
        quota.allocate(60).unwrap();
        let err = quota.allocate(50).unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded {
                requested: 50,
                available: 40
            }
        ));
        quota.free(60);
        assert_eq!(quota.used(), 0);
        quota.allocate(100).unwrap();
    }

    #[test]
    fn test_unlimited_tracks_usage() {
        let quota = MemoryQuota::unlimited();
        quota.allocate(1 << 40).unwrap();
        assert_eq!(quota.used(), 1 << 40);
        assert_eq!(quota.available(), u64::MAX);
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let quota = Arc::new(MemoryQuota::new(1024));
        {
            let mut r = quota.reserve(512).unwrap();
            r.grow(256).unwrap();
            assert_eq!(quota.used(), 768);
            assert!(r.grow(512).is_err());
        }
        assert_eq!(quota.used(), 0);
    }
}
