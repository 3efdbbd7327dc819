//! Compressed file writer
//!
//! Splits the input into fixed-size blocks, compresses each block and
//! appends it to the data writer while recording its length in the address
//! mapper. On close the mapper and any hint data are stored after the
//! blocks (or in the meta file) and the info sidecar is written.

use super::address_mapper::CompressFileAddressMapper;
use super::compressor::{Compressor, CompressorParams};
use super::info::{
    CompressFileInfo, INFO_ADDRESS_MAPPER_BATCH_NUMBER, INFO_ADDRESS_MAPPER_LEN, INFO_COMPRESSOR,
    INFO_HINT_BLOCK_COUNT, INFO_HINT_DATA_LEN, INFO_LIB_VERSION, INFO_META_FILE,
};
use crate::writer::FileWriter;
use indexfs_common::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Upper bound of the hint dictionary
const MAX_HINT_LEN: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HintState {
    Disabled,
    /// Buffering leading blocks until enough are sampled
    Training,
    Ready,
}

#[derive(Debug)]
pub struct CompressFileWriter {
    path: String,
    data: Box<dyn FileWriter>,
    info: Box<dyn FileWriter>,
    meta: Option<Box<dyn FileWriter>>,
    compressor: Compressor,
    params: CompressorParams,
    block_size: usize,
    buffer: Vec<u8>,
    pending: Vec<Vec<u8>>,
    hint_state: HintState,
    hint: Vec<u8>,
    mapper: CompressFileAddressMapper,
    logic_length: u64,
    closed: bool,
}

impl CompressFileWriter {
    /// `meta` must be given exactly when `params.enable_meta_file` is set
    pub fn new(
        path: impl Into<String>,
        data: Box<dyn FileWriter>,
        info: Box<dyn FileWriter>,
        meta: Option<Box<dyn FileWriter>>,
        compressor: Compressor,
        block_size: usize,
        params: CompressorParams,
    ) -> Result<Self> {
        let path = path.into();
        if block_size == 0 {
            return Err(Error::bad_parameter(format!(
                "{path}: compress block size must be positive"
            )));
        }
        if meta.is_some() != params.enable_meta_file {
            return Err(Error::internal(format!(
                "{path}: meta writer does not match enable_meta_file"
            )));
        }
        let hint_state = if !params.enable_hint_data || params.hint_sample_block_count == 0 {
            HintState::Disabled
        } else if compressor.supports_hint() {
            HintState::Training
        } else {
            warn!(
                "Compressor {} has no hint support, writing {} without hint data",
                compressor.name(),
                path
            );
            HintState::Disabled
        };
        Ok(Self {
            path,
            data,
            info,
            meta,
            compressor,
            params,
            block_size,
            buffer: Vec::with_capacity(block_size),
            pending: Vec::new(),
            hint_state,
            hint: Vec::new(),
            mapper: CompressFileAddressMapper::new(),
            logic_length: 0,
            closed: false,
        })
    }

    fn sample_window(&self) -> usize {
        self.params.hint_sample_block_count * self.params.hint_sample_stride()
    }

    fn push_block(&mut self, block: Vec<u8>) -> Result<()> {
        if self.hint_state == HintState::Training {
            self.pending.push(block);
            if self.pending.len() >= self.sample_window() {
                self.finish_training()?;
            }
            return Ok(());
        }
        self.emit_block(&block)
    }

    fn finish_training(&mut self) -> Result<()> {
        let stride = self.params.hint_sample_stride();
        let mut hint = Vec::new();
        for block in self
            .pending
            .iter()
            .step_by(stride)
            .take(self.params.hint_sample_block_count)
        {
            let room = MAX_HINT_LEN - hint.len();
            hint.extend_from_slice(&block[..block.len().min(room)]);
            if hint.len() == MAX_HINT_LEN {
                break;
            }
        }
        if hint.is_empty() {
            self.hint_state = HintState::Disabled;
        } else {
            debug!("Trained {} bytes of hint data for {}", hint.len(), self.path);
            self.hint = hint;
            self.hint_state = HintState::Ready;
        }
        for block in std::mem::take(&mut self.pending) {
            self.emit_block(&block)?;
        }
        Ok(())
    }

    fn emit_block(&mut self, block: &[u8]) -> Result<()> {
        let plain = self.compressor.compress(block, None)?;
        let (bytes, use_hint) = if self.hint_state == HintState::Ready {
            let hinted = self.compressor.compress(block, Some(&self.hint))?;
            if self.params.hint_always_use_hint || hinted.len() < plain.len() {
                (hinted, true)
            } else {
                (plain, false)
            }
        } else {
            (plain, false)
        };
        self.data.write(&bytes)?;
        self.mapper.add_block(bytes.len() as u64, use_hint);
        Ok(())
    }

    /// Compressed file summary, as written on close
    fn build_info(&self, mapper_len: usize, hint_len: usize) -> CompressFileInfo {
        let mut additional = BTreeMap::new();
        additional.insert(INFO_COMPRESSOR.to_string(), self.compressor.name().to_string());
        additional.insert(
            INFO_ADDRESS_MAPPER_BATCH_NUMBER.to_string(),
            self.params.address_mapper_batch_number.to_string(),
        );
        additional.insert(
            INFO_HINT_BLOCK_COUNT.to_string(),
            self.mapper.hint_block_count().to_string(),
        );
        additional.insert(INFO_HINT_DATA_LEN.to_string(), hint_len.to_string());
        additional.insert(INFO_ADDRESS_MAPPER_LEN.to_string(), mapper_len.to_string());
        additional.insert(
            INFO_LIB_VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        additional.insert(
            INFO_META_FILE.to_string(),
            self.params.enable_meta_file.to_string(),
        );
        CompressFileInfo {
            compressor_name: self.compressor.name().to_string(),
            block_count: self.mapper.block_count() as u64,
            block_size: self.block_size as u64,
            compress_file_len: self.mapper.compress_file_length(),
            decompress_file_len: self.logic_length,
            enable_compress_address_mapper: self.params.encode_address_mapper,
            additional_info: additional,
        }
    }

    /// Number of blocks written so far
    pub fn block_count(&self) -> usize {
        self.mapper.block_count()
    }
}

impl FileWriter for CompressFileWriter {
    fn logical_path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::internal(format!("{} already closed", self.path)));
        }
        self.logic_length += data.len() as u64;
        while !data.is_empty() {
            let take = (self.block_size - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == self.block_size {
                let block = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.block_size));
                self.push_block(block)?;
            }
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.data.length()
    }

    fn logic_length(&self) -> u64 {
        self.logic_length
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.buffer.is_empty() {
            let block = std::mem::take(&mut self.buffer);
            self.push_block(block)?;
        }
        if self.hint_state == HintState::Training {
            self.finish_training()?;
        }

        let (mapper_bytes, encoded) = self.mapper.serialize(
            self.params.encode_address_mapper,
            self.params.address_mapper_batch_number,
        );
        let hint_len = if self.mapper.hint_block_count() > 0 {
            self.hint.len()
        } else {
            0
        };

        let tail = self.meta.as_mut().unwrap_or(&mut self.data);
        tail.write(&mapper_bytes)?;
        if hint_len > 0 {
            tail.write(&self.hint)?;
        }
        if let Some(meta) = self.meta.as_mut() {
            meta.close()?;
        }
        self.data.close()?;

        let info = self.build_info(mapper_bytes.len(), hint_len);
        self.info.write(info.to_json()?.as_bytes())?;
        self.info.close()?;
        self.closed = true;

        debug!(
            "Closed compressed file {}: {} -> {} bytes in {} blocks, mapper {} bytes{}",
            self.path,
            info.decompress_file_len,
            info.compress_file_len,
            info.block_count,
            mapper_bytes.len(),
            if encoded { " (encoded)" } else { "" }
        );
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
