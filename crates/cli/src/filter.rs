//! Change filtering
//!
//! Two sources of ignore rules:
//! 1. Built-in editor and OS scratch files (on unless disabled)
//! 2. `--ignore` globs in gitignore syntax, matched relative to each
//!    watched directory

use anyhow::{Context, Result};
use dirwatch::ChangeRecord;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};

/// Ignore rules for every watched directory
pub struct FilterSet {
    /// One matcher per watched directory, rooted there
    roots: Vec<(PathBuf, Gitignore)>,
    builtin: bool,
}

impl FilterSet {
    pub fn new(directories: &[PathBuf], globs: &[String], builtin: bool) -> Result<Self> {
        let mut roots = Vec::with_capacity(directories.len());
        for directory in directories {
            let mut builder = GitignoreBuilder::new(directory);
            for glob in globs {
                builder
                    .add_line(None, glob)
                    .with_context(|| format!("Invalid ignore pattern: {}", glob))?;
            }
            let matcher = builder
                .build()
                .context("Failed to build ignore rules")?;
            roots.push((directory.clone(), matcher));
        }
        Ok(Self { roots, builtin })
    }

    /// Whether `record` should be hidden. Overflow records never are.
    pub fn is_ignored(&self, record: &ChangeRecord) -> bool {
        if record.action == dirwatch::FileAction::TooManyChanges {
            return false;
        }
        self.is_ignored_path(Path::new(&record.path), record.is_directory)
    }

    pub fn is_ignored_path(&self, path: &Path, is_dir: bool) -> bool {
        if self.builtin && is_scratch_file(path) {
            return true;
        }

        let Some((root, matcher)) = self
            .roots
            .iter()
            .find(|(root, _)| path.starts_with(root))
        else {
            return false;
        };
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };

        // A match on any parent directory hides everything below it
        relative
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty())
            .enumerate()
            .any(|(depth, p)| matcher.matched(p, depth > 0 || is_dir).is_ignore())
    }
}

/// Editor swap, backup and lock files and OS metadata files
fn is_scratch_file(path: &Path) -> bool {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    // Vim swap files
    if filename.ends_with(".swp") || filename.ends_with(".swo") || filename.ends_with(".swx") {
        return true;
    }

    // Vim/Emacs backups
    if filename.ends_with('~') {
        return true;
    }

    // Emacs auto-save and lock files
    if (filename.starts_with('#') && filename.ends_with('#')) || filename.starts_with(".#") {
        return true;
    }

    filename == ".DS_Store" || filename.starts_with("._") || filename == "Thumbs.db" || filename == "desktop.ini"
}
