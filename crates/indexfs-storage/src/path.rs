//! Logical path utilities
//!
//! Logical paths are POSIX-style, relative to the file system root and never
//! carry a leading or trailing `/`. The root itself is the empty string.

use crate::layout::RESERVED_SUFFIXES;
use indexfs_common::{Error, Result};

/// Normalize a logical path
///
/// Collapses repeated separators, drops `.` segments and resolves `..`.
/// A `..` that would climb above the root is rejected.
pub fn normalize_path(path: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::bad_parameter(format!(
                        "path {path} escapes the file system root"
                    )));
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// Join two logical path fragments without normalizing
#[must_use]
pub fn join_path(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    match (base.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{name}"),
    }
}

/// Parent of a normalized path (`""` for top-level entries)
#[must_use]
pub fn parent_path(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

/// Last component of a normalized path
#[must_use]
pub fn file_name(path: &str) -> &str {
    path.rfind('/').map_or(path, |idx| &path[idx + 1..])
}

/// Whether `child` equals `parent` or lives below it
#[must_use]
pub fn is_sub_path(parent: &str, child: &str) -> bool {
    if parent.is_empty() {
        return true;
    }
    child == parent
        || (child.len() > parent.len()
            && child.starts_with(parent)
            && child.as_bytes()[parent.len()] == b'/')
}

/// `child` relative to `parent`, or `None` when it is not below it
#[must_use]
pub fn relative_to<'a>(parent: &str, child: &'a str) -> Option<&'a str> {
    if parent.is_empty() {
        return Some(child);
    }
    if child == parent {
        return Some("");
    }
    if is_sub_path(parent, child) {
        Some(&child[parent.len() + 1..])
    } else {
        None
    }
}

/// All proper ancestors of a normalized path, outermost first
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(idx, _)| &path[..idx])
}

/// Whether the path ends with one of the compressed-file sidecar suffixes
#[must_use]
pub fn has_reserved_suffix(path: &str) -> bool {
    RESERVED_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}
