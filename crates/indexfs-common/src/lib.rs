//! IndexFS Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, the open/file/storage type
//! enums, configuration structures and checksum helpers used by every
//! IndexFS crate.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator, file_identity};
pub use config::{FileSystemConfig, OutputStorage};
pub use error::{Error, ErrorKind, Result};
pub use types::*;
