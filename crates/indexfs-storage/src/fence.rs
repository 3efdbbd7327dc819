//! Commit fencing
//!
//! A writer acquires the fence of a physical root before building, which
//! durably records a fresh token there. A commit validates that its token
//! is still the current one; an older attempt that lost the fence to a
//! retry fails with [`Error::Fenced`] instead of overwriting newer data.

use crate::layout::FENCE_FILE;
use crate::storage::disk::dump_file;
use indexfs_common::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceContext {
    root: PathBuf,
    token: String,
}

impl FenceContext {
    /// Take over the fence of `root`
    pub fn acquire(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let token = uuid::Uuid::new_v4().simple().to_string();
        dump_file(&root.join(FENCE_FILE), token.as_bytes())?;
        info!("Acquired fence {} on {}", token, root.display());
        Ok(Self { root, token })
    }

    /// Current token of `root`, `None` when no writer ever acquired it
    pub fn current(root: &Path) -> Result<Option<String>> {
        let path = root.join(FENCE_FILE);
        match fs::read_to_string(&path) {
            Ok(token) => Ok(Some(token.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path.to_string_lossy(), e)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Fail unless this context still holds the fence
    pub fn validate(&self) -> Result<()> {
        let current = Self::current(&self.root)?.unwrap_or_default();
        if current != self.token {
            return Err(Error::Fenced {
                expected: current,
                actual: self.token.clone(),
            });
        }
        Ok(())
    }
}
