//! IndexFS Framework - versions and segments
//!
//! The layer that consumes the logical file system:
//! - `Version`: committed, strictly increasing segment lists
//! - Segment and version naming grammar and listings
//! - Fenced version commits with bounded retries

pub mod committer;
pub mod naming;
pub mod retry;
pub mod version;

pub use committer::VersionCommitter;
pub use naming::{
    latest_version, list_segment, list_version, list_version_in, parse_segment_dir,
    parse_version_file, segment_dir_name, version_file_name,
};
pub use retry::RetryPolicy;
pub use version::Version;
