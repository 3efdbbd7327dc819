//! Segment and version naming
//!
//! Index roots hold `segment_<id>_level_<level>` directories and
//! `version.<id>` files. Listings only return names that follow this
//! grammar exactly, in ascending numeric order.

use indexfs_common::{Error, Result, SegmentId, VersionId};
use indexfs_storage::Directory;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

static SEGMENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^segment_(\d+)_level_(\d+)$").expect("segment pattern"));

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^version\.(\d+)$").expect("version pattern"));

pub fn segment_dir_name(id: SegmentId, level: u32) -> String {
    format!("segment_{id}_level_{level}")
}

pub fn version_file_name(id: VersionId) -> String {
    format!("version.{id}")
}

/// Segment id and level of a segment directory name
pub fn parse_segment_dir(name: &str) -> Option<(SegmentId, u32)> {
    let caps = SEGMENT_PATTERN.captures(name)?;
    let id = caps[1].parse().ok()?;
    let level = caps[2].parse().ok()?;
    Some((SegmentId::new(id), level))
}

pub fn parse_version_file(name: &str) -> Option<VersionId> {
    VERSION_PATTERN.captures(name)?[1].parse().ok()
}

/// Segment directory names among `names`, by segment id
pub fn sort_segments<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut segments: Vec<(SegmentId, String)> = names
        .into_iter()
        .filter_map(|name| {
            let name = name.as_ref();
            parse_segment_dir(name).map(|(id, _)| (id, name.to_string()))
        })
        .collect();
    segments.sort();
    segments.into_iter().map(|(_, name)| name).collect()
}

/// Version ids among `names`, ascending
pub fn sort_versions<I, S>(names: I) -> Vec<VersionId>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut versions: Vec<VersionId> = names
        .into_iter()
        .filter_map(|name| parse_version_file(name.as_ref()))
        .collect();
    versions.sort_unstable();
    versions.dedup();
    versions
}

/// Segment directories directly below `dir`
pub fn list_segment(dir: &Directory) -> Result<Vec<String>> {
    let names = dir.list_dir("", false)?;
    Ok(sort_segments(
        names.into_iter().filter(|name| dir.is_dir(name).unwrap_or(false)),
    ))
}

/// Versions committed directly below `dir`
pub fn list_version(dir: &Directory) -> Result<Vec<VersionId>> {
    let names = dir.list_dir("", false)?;
    Ok(sort_versions(
        names.into_iter().filter(|name| !dir.is_dir(name).unwrap_or(true)),
    ))
}

pub fn latest_version(dir: &Directory) -> Result<Option<VersionId>> {
    Ok(list_version(dir)?.last().copied())
}

/// Versions in a physical index root, for tools that run without a file system
pub fn list_version_in(root: &Path) -> Result<Vec<VersionId>> {
    let listing = fs::read_dir(root)
        .map_err(|e| Error::io(root.to_string_lossy(), e))?;
    let mut names = Vec::new();
    for item in listing {
        let item = item.map_err(|e| Error::io(root.to_string_lossy(), e))?;
        names.push(item.file_name().to_string_lossy().into_owned());
    }
    Ok(sort_versions(names))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grammar_is_strict() {
        assert_eq!(
            parse_segment_dir("segment_12_level_3"),
            Some((SegmentId::new(12), 3))
        );
        for bad in [
            "segment_12",
            "segment_x_level_0",
            "segment_1_level_0.bak",
            "my_segment_1_level_0",
            "segment_-1_level_0",
        ] {
            assert_eq!(parse_segment_dir(bad), None, "{bad}");
        }
        assert_eq!(parse_version_file("version.10"), Some(VersionId::new(10)));
        for bad in ["version.", "version.1a", "version_1", "version.1.tmp"] {
            assert_eq!(parse_version_file(bad), None, "{bad}");
        }
    }

    #[test]
    fn test_numeric_order() {
        let names = [
            "segment_10_level_0",
            "segment_2_level_1",
            "version.10",
            "segment_1_level_0",
            "version.9",
            "junk",
        ];
        assert_eq!(
            sort_segments(names),
            vec!["segment_1_level_0", "segment_2_level_1", "segment_10_level_0"]
        );
        assert_eq!(
            sort_versions(names),
            vec![VersionId::new(9), VersionId::new(10)]
        );
    }

    #[test]
    fn test_physical_listing() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["version.3", "version.1", "version.2.__tmp__abc", "entry_table.3"] {
            std::fs::write(dir.path().join(name), b"{}").unwrap();
        }
        assert_eq!(
            list_version_in(dir.path()).unwrap(),
            vec![VersionId::new(1), VersionId::new(3)]
        );
    }
}
