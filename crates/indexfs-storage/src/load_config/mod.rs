//! Load configuration
//!
//! Maps logical file paths to the strategy used to materialize them.

mod list;
mod rule;
mod strategy;

pub use list::LoadConfigList;
pub use rule::{DEFAULT_CONFIG_NAME, DEFAULT_PATTERN, LoadConfig};
pub use strategy::{
    BufferedLoadStrategy, CacheLoadStrategy, DEFAULT_BUFFER_SIZE, DEFAULT_CACHE_BLOCK_SIZE,
    DEFAULT_LOCK_SLICE, LoadStrategy, MAX_LOCK_SLICE, MmapLoadStrategy,
};
