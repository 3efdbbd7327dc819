//! Block compressors and per-file compressor parameters

use indexfs_common::{Error, Result};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Supported block codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressorKind {
    Lz4,
    Zstd,
    Zlib,
}

/// A named block compressor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compressor {
    kind: CompressorKind,
    level: i32,
}

impl Compressor {
    /// Resolve a compressor by name (`lz4`, `zstd`, `zlib`)
    pub fn from_name(name: &str, level: Option<i32>) -> Result<Self> {
        let kind = match name {
            "lz4" => CompressorKind::Lz4,
            "zstd" => CompressorKind::Zstd,
            "zlib" => CompressorKind::Zlib,
            other => {
                return Err(Error::bad_parameter(format!("unknown compressor {other}")));
            }
        };
        let level = level.unwrap_or(match kind {
            CompressorKind::Lz4 => 0,
            CompressorKind::Zstd => zstd::DEFAULT_COMPRESSION_LEVEL,
            CompressorKind::Zlib => 6,
        });
        Ok(Self { kind, level })
    }

    pub const fn kind(&self) -> CompressorKind {
        self.kind
    }

    pub const fn name(&self) -> &'static str {
        match self.kind {
            CompressorKind::Lz4 => "lz4",
            CompressorKind::Zstd => "zstd",
            CompressorKind::Zlib => "zlib",
        }
    }

    pub const fn level(&self) -> i32 {
        self.level
    }

    /// Whether blocks can be compressed against hint data
    pub const fn supports_hint(&self) -> bool {
        matches!(self.kind, CompressorKind::Zstd)
    }

    /// Compress one block, optionally against hint data
    pub fn compress(&self, src: &[u8], hint: Option<&[u8]>) -> Result<Vec<u8>> {
        let out = match (self.kind, hint) {
            (CompressorKind::Zstd, Some(hint)) => {
                zstd::bulk::Compressor::with_dictionary(self.level, hint)
                    .and_then(|mut c| c.compress(src))
            }
            (CompressorKind::Zstd, None) => zstd::bulk::compress(src, self.level),
            (CompressorKind::Lz4, _) => {
                let mode = (self.level > 0)
                    .then_some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level));
                lz4::block::compress(src, mode, false)
            }
            (CompressorKind::Zlib, _) => {
                let level = flate2::Compression::new(self.level.clamp(0, 9).unsigned_abs());
                let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(src).and_then(|()| encoder.finish())
            }
        };
        out.map_err(|e| Error::Compression(format!("{} compress: {e}", self.name())))
    }

    /// Decompress one block whose decompressed length is known
    pub fn decompress(&self, src: &[u8], hint: Option<&[u8]>, len: usize) -> Result<Vec<u8>> {
        let out = match (self.kind, hint) {
            (CompressorKind::Zstd, Some(hint)) => zstd::bulk::Decompressor::with_dictionary(hint)
                .and_then(|mut d| d.decompress(src, len)),
            (CompressorKind::Zstd, None) => zstd::bulk::decompress(src, len),
            (CompressorKind::Lz4, _) => {
                let size = i32::try_from(len).map_err(|_| {
                    Error::Compression(format!("lz4 block of {len} bytes is too large"))
                })?;
                lz4::block::decompress(src, Some(size))
            }
            (CompressorKind::Zlib, _) => {
                let mut out = Vec::with_capacity(len);
                flate2::read::ZlibDecoder::new(src)
                    .read_to_end(&mut out)
                    .map(|_| out)
            }
        };
        let out = out.map_err(|e| Error::Compression(format!("{} decompress: {e}", self.name())))?;
        if out.len() != len {
            return Err(Error::Compression(format!(
                "{} block decompressed to {} bytes, expected {len}",
                self.name(),
                out.len()
            )));
        }
        Ok(out)
    }
}

/// Per-file compressor parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CompressorParams {
    /// Store the address mapper varint encoded when that is smaller
    pub encode_address_mapper: bool,
    /// Blocks per encoded mapper batch
    pub address_mapper_batch_number: u32,
    /// Write mapper and hint data to `<name>.__compress_meta__`
    pub enable_meta_file: bool,
    pub enable_hint_data: bool,
    /// Fraction of leading blocks sampled into the hint
    pub hint_sample_ratio: f64,
    /// Number of sampled blocks
    pub hint_sample_block_count: usize,
    /// Use the hint for every block even when it does not shrink it
    pub hint_always_use_hint: bool,
    pub compress_level: Option<i32>,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            encode_address_mapper: false,
            address_mapper_batch_number: 64,
            enable_meta_file: false,
            enable_hint_data: false,
            hint_sample_ratio: 0.1,
            hint_sample_block_count: 8,
            hint_always_use_hint: false,
            compress_level: None,
        }
    }
}

impl CompressorParams {
    /// Parse the string map carried by writer options
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut params = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "encode_address_mapper" => params.encode_address_mapper = parse(key, value)?,
                "address_mapper_batch_number" => {
                    params.address_mapper_batch_number = parse(key, value)?;
                }
                "enable_meta_file" => params.enable_meta_file = parse(key, value)?,
                "enable_hint_data" => params.enable_hint_data = parse(key, value)?,
                "hint_sample_ratio" => params.hint_sample_ratio = parse(key, value)?,
                "hint_sample_block_count" => params.hint_sample_block_count = parse(key, value)?,
                "hint_always_use_hint" => params.hint_always_use_hint = parse(key, value)?,
                "compress_level" => params.compress_level = Some(parse(key, value)?),
                other => {
                    tracing::warn!("Ignoring unknown compressor parameter {}={}", other, value);
                }
            }
        }
        params.check()?;
        Ok(params)
    }

    pub fn check(&self) -> Result<()> {
        if self.address_mapper_batch_number == 0 {
            return Err(Error::bad_parameter(
                "address_mapper_batch_number must be positive",
            ));
        }
        if !(self.hint_sample_ratio > 0.0 && self.hint_sample_ratio <= 1.0) {
            return Err(Error::bad_parameter(format!(
                "hint_sample_ratio {} must be in (0, 1]",
                self.hint_sample_ratio
            )));
        }
        Ok(())
    }

    /// Distance between two sampled hint blocks
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn hint_sample_stride(&self) -> usize {
        ((1.0 / self.hint_sample_ratio).round() as usize).max(1)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::bad_parameter(format!("invalid compressor parameter {key}={value}")))
}
