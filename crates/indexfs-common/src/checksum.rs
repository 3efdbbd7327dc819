//! Checksum utilities for IndexFS
//!
//! CRC32C guards persisted metadata (package meta, address mappers);
//! xxHash64 gives stable file identities for block cache keys.

use serde::{Deserialize, Serialize};

/// Checksum values computed for a buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (inline verification)
    pub crc32c: u32,
    /// xxHash64 (comparison)
    pub xxhash64: u64,
}

impl Checksum {
    #[must_use]
    pub const fn new(crc32c: u32, xxhash64: u64) -> Self {
        Self { crc32c, xxhash64 }
    }

    /// Compute checksum from data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }

    /// Verify data against this checksum
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c && xxhash_rust::xxh64::xxh64(data, 0) == self.xxhash64
    }
}

/// Streaming checksum calculator
pub struct ChecksumCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
    len: u64,
}

impl ChecksumCalculator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
            len: 0,
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes fed so far
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finalize and return the checksum
    #[must_use]
    pub fn finalize(self) -> Checksum {
        Checksum {
            crc32c: self.crc32c,
            xxhash64: self.xxhash_state.digest(),
        }
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable 64-bit identity of a file, used to key cached blocks
#[must_use]
pub fn file_identity(path: &str) -> u64 {
    xxhash_rust::xxh64::xxh64(path.as_bytes(), 0x1dfe_5eed)
}
