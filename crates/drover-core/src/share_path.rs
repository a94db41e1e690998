//! Classification and parsing of network-share paths.
//!
//! Share paths arrive from the configuration layer either as
//! `smb://server/share/sub/path` or as the `//server/share/sub/path`
//! shorthand. Both normalize to the same parsed form.

use std::path::PathBuf;

use crate::errors::{CopyError, CopyResult};

/// True if `path` addresses a network share rather than a local file.
pub fn is_share_path(path: &str) -> bool {
    path.starts_with("smb://") || path.starts_with("//")
}

/// A parsed network-share path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePath {
    pub server: String,
    pub share: String,
    /// Path below the share root; empty for the share root itself.
    pub rel: PathBuf,
}

impl SharePath {
    pub fn parse(raw: &str) -> CopyResult<Self> {
        let rest = raw
            .strip_prefix("smb://")
            .or_else(|| raw.strip_prefix("//"))
            .ok_or_else(|| CopyError::InvalidPath(raw.to_string()))?;
        let rest = rest.trim_start_matches('/');

        let mut segments = rest.splitn(3, '/');
        let server = segments.next().unwrap_or_default();
        let share = segments.next().unwrap_or_default();
        if server.is_empty() || share.is_empty() {
            return Err(CopyError::InvalidPath(raw.to_string()));
        }
        let rel = segments
            .next()
            .map(|tail| PathBuf::from(tail.trim_end_matches('/')))
            .unwrap_or_default();

        Ok(SharePath {
            server: server.to_string(),
            share: share.to_string(),
            rel,
        })
    }

    /// Rebuild the canonical `smb://` form, mostly for log lines.
    pub fn display(&self) -> String {
        if self.rel.as_os_str().is_empty() {
            format!("smb://{}/{}", self.server, self.share)
        } else {
            format!("smb://{}/{}/{}", self.server, self.share, self.rel.display())
        }
    }
}
