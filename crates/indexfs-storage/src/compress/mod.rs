//! Block-compressed files
//!
//! A compressed file `f` is stored as the data file `f` (compressed blocks,
//! optionally followed by the address mapper and hint data), the info
//! sidecar `f.__compress_info__` and, when meta files are enabled,
//! `f.__compress_meta__` holding the mapper and hint instead.

mod address_mapper;
mod compressor;
mod info;
mod reader;
mod writer;

pub use address_mapper::CompressFileAddressMapper;
pub use compressor::{Compressor, CompressorKind, CompressorParams};
pub use info::{
    CompressFileInfo, INFO_ADDRESS_MAPPER_BATCH_NUMBER, INFO_ADDRESS_MAPPER_LEN, INFO_COMPRESSOR,
    INFO_HINT_BLOCK_COUNT, INFO_HINT_DATA_LEN, INFO_LIB_VERSION, INFO_META_FILE,
};
pub use reader::{CompressFileReader, CompressMeta};
pub use writer::CompressFileWriter;
