//! Versions
//!
//! A version is the committed set of segments of an index. Segment ids
//! only ever grow inside a version; each segment lives in its own
//! `segment_<id>_level_<level>` directory.

use crate::naming::{segment_dir_name, version_file_name};
use indexfs_common::{Error, Result, SegmentId, VersionId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    #[serde(rename = "versionid")]
    version_id: VersionId,
    /// Strictly increasing
    segments: Vec<SegmentId>,
    /// Level of each segment, parallel to `segments`
    levels: Vec<u32>,
    /// Milliseconds since the epoch of the data the version covers
    #[serde(default)]
    timestamp: i64,
    /// Token of the fence the version was committed under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fence_name: Option<String>,
}

impl Version {
    pub const fn new(version_id: VersionId) -> Self {
        Self {
            version_id,
            segments: Vec::new(),
            levels: Vec::new(),
            timestamp: 0,
            fence_name: None,
        }
    }

    pub const fn version_id(&self) -> VersionId {
        self.version_id
    }

    pub fn segments(&self) -> &[SegmentId] {
        &self.segments
    }

    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub const fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    pub fn fence_name(&self) -> Option<&str> {
        self.fence_name.as_deref()
    }

    pub fn set_fence_name(&mut self, fence_name: impl Into<String>) {
        self.fence_name = Some(fence_name.into());
    }

    /// Append a segment; its id must exceed every id already present
    pub fn add_segment(&mut self, id: SegmentId, level: u32) -> Result<()> {
        if let Some(&last) = self.segments.last() {
            if id <= last {
                return Err(Error::corruption(format!(
                    "version {}: segment {id} added after segment {last}",
                    self.version_id
                )));
            }
        }
        self.segments.push(id);
        self.levels.push(level);
        Ok(())
    }

    pub fn has_segment(&self, id: SegmentId) -> bool {
        self.segments.binary_search(&id).is_ok()
    }

    pub fn segment_level(&self, id: SegmentId) -> Option<u32> {
        self.segments
            .binary_search(&id)
            .ok()
            .map(|idx| self.levels[idx])
    }

    /// Directory name of a segment of this version
    pub fn segment_directory_name(&self, id: SegmentId) -> Result<String> {
        let level = self.segment_level(id).ok_or_else(|| {
            Error::not_found(format!("segment {id} in version {}", self.version_id))
        })?;
        Ok(segment_dir_name(id, level))
    }

    /// Directory names of every segment, in segment order
    pub fn segment_directory_names(&self) -> Vec<String> {
        self.segments
            .iter()
            .zip(&self.levels)
            .map(|(&id, &level)| segment_dir_name(id, level))
            .collect()
    }

    pub fn file_name(&self) -> String {
        version_file_name(self.version_id)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("version {}: {e}", self.version_id)))
    }

    /// Parse and validate a version file
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let version: Self = serde_json::from_slice(data)
            .map_err(|e| Error::corruption(format!("malformed version file: {e}")))?;
        if version.segments.len() != version.levels.len() {
            return Err(Error::corruption(format!(
                "version {}: {} segments but {} levels",
                version.version_id,
                version.segments.len(),
                version.levels.len()
            )));
        }
        if let Some(pair) = version.segments.windows(2).find(|w| w[0] >= w[1]) {
            return Err(Error::corruption(format!(
                "version {}: segment {} listed after {}",
                version.version_id, pair[1], pair[0]
            )));
        }
        Ok(version)
    }

    /// Read `version.<id>` from a physical index root
    pub fn load(root: &Path, version_id: VersionId) -> Result<Self> {
        let path = root.join(version_file_name(version_id));
        let data = fs::read(&path).map_err(|e| Error::io(path.to_string_lossy(), e))?;
        let version = Self::from_json(&data)?;
        if version.version_id != version_id {
            return Err(Error::corruption(format!(
                "{} holds version {}",
                path.display(),
                version.version_id
            )));
        }
        Ok(version)
    }
}
