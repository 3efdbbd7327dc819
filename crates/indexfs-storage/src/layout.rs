//! On-disk naming and layout definitions
//!
//! Compressed file layout:
//! ```text
//! <name>                       compressed blocks [+ address mapper + hint data]
//! <name>.__compress_info__     JSON summary (block count, lengths, additional info)
//! <name>.__compress_meta__     address mapper + hint data (meta-file mode only)
//! ```
//!
//! Package directory layout:
//! ```text
//! <dir>/package_file.__data__0   packed file bytes, shard 0
//! <dir>/package_file.__data__1   packed file bytes, shard 1 (after a later flush)
//! <dir>/package_file.__meta__    JSON: entry name -> (shard, offset, length)
//! ```
//!
//! Version root layout:
//! ```text
//! <root>/entry_table.<versionId>  JSON: logical file -> physical location
//! <root>/__fence__                current commit fence token
//! ```

/// Sidecar holding the compress summary of `<name>`
pub const COMPRESS_INFO_SUFFIX: &str = ".__compress_info__";

/// Sidecar holding the address mapper of `<name>` in meta-file mode
pub const COMPRESS_META_SUFFIX: &str = ".__compress_meta__";

/// Name of the shared address-mapper resource of `<name>`
pub const COMPRESS_RESOURCE_MMAP_SUFFIX: &str = ".compress_resource_mmap";

/// Suffixes that can never be used as literal data file names
pub const RESERVED_SUFFIXES: [&str; 3] = [
    COMPRESS_INFO_SUFFIX,
    COMPRESS_META_SUFFIX,
    COMPRESS_RESOURCE_MMAP_SUFFIX,
];

/// Prefix of every physical package file
pub const PACKAGE_FILE_PREFIX: &str = "package_file";

/// Package meta file name
pub const PACKAGE_META_FILE: &str = "package_file.__meta__";

/// Package data shard name prefix, followed by the shard index
pub const PACKAGE_DATA_PREFIX: &str = "package_file.__data__";

/// Entry table file name prefix, followed by the version id
pub const ENTRY_TABLE_PREFIX: &str = "entry_table.";

/// Durable fence token file
pub const FENCE_FILE: &str = "__fence__";

/// Logical alias under which link directories expose flushed files
pub const ROOT_LINK_NAME: &str = "__FS_ROOT_LINK__";

/// Marker in temporary file names written during atomic dumps
pub const TEMP_FILE_MARKER: &str = ".__tmp__";

/// Alignment requirement for direct I/O (4KB)
pub const ALIGNMENT: usize = 4096;

/// Package data shard file name
#[must_use]
pub fn package_data_file(shard: u32) -> String {
    format!("{PACKAGE_DATA_PREFIX}{shard}")
}

/// Entry table file name of a version
#[must_use]
pub fn entry_table_file(version: u64) -> String {
    format!("{ENTRY_TABLE_PREFIX}{version}")
}

/// Sidecar info path of a compressed file
#[must_use]
pub fn compress_info_path(path: &str) -> String {
    format!("{path}{COMPRESS_INFO_SUFFIX}")
}

/// Sidecar meta path of a compressed file
#[must_use]
pub fn compress_meta_path(path: &str) -> String {
    format!("{path}{COMPRESS_META_SUFFIX}")
}

/// Resource name of the shared address mapper of a compressed file
#[must_use]
pub fn compress_resource_path(path: &str) -> String {
    format!("{path}{COMPRESS_RESOURCE_MMAP_SUFFIX}")
}

/// Whether a physical file name belongs to the package layout
#[must_use]
pub fn is_package_file(name: &str) -> bool {
    name.starts_with(PACKAGE_FILE_PREFIX)
}

/// Shard index of a package data file name
#[must_use]
pub fn parse_package_shard(name: &str) -> Option<u32> {
    name.strip_prefix(PACKAGE_DATA_PREFIX)?.parse().ok()
}

/// Round `value` up to the next multiple of [`ALIGNMENT`]
#[inline]
#[must_use]
pub const fn align_up(value: u64) -> u64 {
    value.div_ceil(ALIGNMENT as u64) * ALIGNMENT as u64
}

/// Round `value` down to a multiple of [`ALIGNMENT`]
#[inline]
#[must_use]
pub const fn align_down(value: u64) -> u64 {
    value / ALIGNMENT as u64 * ALIGNMENT as u64
}
