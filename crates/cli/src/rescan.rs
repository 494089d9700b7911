//! Overflow recovery scanner
//!
//! When a directory overflows, the individual changes are lost. The rescan
//! walks that directory and reports files whose mtime is newer than the
//! previous poll, which covers most of what was dropped.

use crate::filter::FilterSet;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub struct Rescanner {
    /// Start of the previous poll (mtime threshold)
    since: SystemTime,
}

impl Rescanner {
    pub fn new() -> Self {
        Self {
            since: SystemTime::now(),
        }
    }

    /// Move the threshold to the start of the poll that just finished
    pub fn advance(&mut self, poll_started: SystemTime) {
        self.since = poll_started;
    }

    /// Files under `root` modified after the threshold
    pub fn scan(&self, root: &Path, filter: &FilterSet) -> Result<Vec<PathBuf>> {
        let mut changed = Vec::new();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !filter.is_ignored_path(e.path(), e.file_type().is_dir()))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Entries can vanish mid-walk; keep going
                    warn!("Skipping unreadable entry during rescan: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if self.modified_since(entry.path()) {
                changed.push(entry.into_path());
            }
        }

        debug!("Rescan of {} found {} changed files", root.display(), changed.len());
        Ok(changed)
    }

    /// Whether `path` has an mtime past the threshold. A file that vanished
    /// or cannot be stat'ed counts as unchanged.
    fn modified_since(&self, path: &Path) -> bool {
        match fs::symlink_metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime > self.since,
            Err(e) => {
                warn!("Skipping {} during rescan: {}", path.display(), e);
                false
            }
        }
    }
}

impl Default for Rescanner {
    fn default() -> Self {
        Self::new()
    }
}
