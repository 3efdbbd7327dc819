//! Compress file info sidecar

use indexfs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const INFO_COMPRESSOR: &str = "compressor";
pub const INFO_ADDRESS_MAPPER_BATCH_NUMBER: &str = "address_mapper_batch_number";
pub const INFO_HINT_BLOCK_COUNT: &str = "hint_block_count";
pub const INFO_HINT_DATA_LEN: &str = "hint_data_len";
pub const INFO_ADDRESS_MAPPER_LEN: &str = "address_mapper_len";
pub const INFO_LIB_VERSION: &str = "lib_version";
pub const INFO_META_FILE: &str = "enable_meta_file";

/// Summary of a compressed file, stored as `<name>.__compress_info__`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressFileInfo {
    pub compressor_name: String,
    pub block_count: u64,
    pub block_size: u64,
    /// Bytes of compressed blocks, excluding any appended mapper or hint
    pub compress_file_len: u64,
    pub decompress_file_len: u64,
    /// Whether the writer was asked to encode the mapper
    pub enable_compress_address_mapper: bool,
    #[serde(default)]
    pub additional_info: BTreeMap<String, String>,
}

impl CompressFileInfo {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("compress info: {e}")))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let info: Self = serde_json::from_slice(data)
            .map_err(|e| Error::Serialization(format!("compress info: {e}")))?;
        info.validate()?;
        Ok(info)
    }

    /// Check the block count against the lengths
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::corruption("compress info with zero block size"));
        }
        let expected = self.decompress_file_len.div_ceil(self.block_size);
        if self.block_count != expected {
            return Err(Error::corruption(format!(
                "compress info block count {} does not cover {} bytes in blocks of {}",
                self.block_count, self.decompress_file_len, self.block_size
            )));
        }
        Ok(())
    }

    /// Numeric additional info value, 0 when absent
    pub fn additional_u64(&self, key: &str) -> Result<u64> {
        self.additional_info.get(key).map_or(Ok(0), |v| {
            v.parse()
                .map_err(|_| Error::corruption(format!("compress info {key}={v} is not a number")))
        })
    }

    pub fn additional_flag(&self, key: &str) -> bool {
        self.additional_info.get(key).is_some_and(|v| v == "true")
    }

    /// Decompressed length of block `idx`
    pub fn block_logic_length(&self, idx: u64) -> u64 {
        let start = idx * self.block_size;
        self.block_size
            .min(self.decompress_file_len.saturating_sub(start))
    }
}
