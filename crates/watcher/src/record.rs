//! Change records handed to the polling consumer

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Longest relative path (in wide characters) a notification entry can carry.
pub const MAX_RELATIVE_PATH_WIDE: usize = 260;

/// Upper bound on the UTF-8 length of [`ChangeRecord::path`].
///
/// A single wide code unit takes at most three UTF-8 bytes, and one byte
/// is reserved for a terminator.
pub const MAX_RELATIVE_PATH_BYTES: usize = MAX_RELATIVE_PATH_WIDE * 3 - 1;

/// 100ns ticks between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

/// What happened to a file or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum FileAction {
    /// Unrecognized action code. The record still carries full metadata.
    #[default]
    None,
    /// File or directory created
    Added,
    /// File or directory deleted
    Removed,
    /// Contents or timestamps changed
    Modified,
    /// Old name of a renamed entry, always followed by `RenamedTo`
    RenamedFrom,
    /// New name of a renamed entry
    RenamedTo,
    /// The change buffer overflowed; the watched directory should be rescanned
    TooManyChanges,
}

/// One observed filesystem event
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ChangeRecord {
    /// Watched directory path joined with the entry's relative name
    pub path: String,
    /// Type of change
    pub action: FileAction,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Creation time in FILETIME ticks (0 when unknown)
    pub creation_time: u64,
    /// Last content write in FILETIME ticks
    pub modification_time: u64,
    /// Last metadata change in FILETIME ticks
    pub change_time: u64,
    /// Last access in FILETIME ticks
    pub access_time: u64,
    /// File size in bytes
    pub size: u64,
    /// Raw attribute bits as reported with the notification
    pub attributes: u32,
}

impl ChangeRecord {
    /// Record reporting that `directory` overflowed its change buffer.
    ///
    /// Carries no timestamps since no raw entry survived.
    pub fn too_many_changes(directory: String) -> Self {
        Self {
            path: bounded_path(directory),
            action: FileAction::TooManyChanges,
            is_directory: true,
            ..Self::default()
        }
    }

    /// Returns true for either half of a rename pair.
    pub fn is_rename(&self) -> bool {
        matches!(self.action, FileAction::RenamedFrom | FileAction::RenamedTo)
    }

    pub fn created_at(&self) -> Option<SystemTime> {
        filetime_to_system_time(self.creation_time)
    }

    pub fn modified_at(&self) -> Option<SystemTime> {
        filetime_to_system_time(self.modification_time)
    }

    pub fn changed_at(&self) -> Option<SystemTime> {
        filetime_to_system_time(self.change_time)
    }

    pub fn accessed_at(&self) -> Option<SystemTime> {
        filetime_to_system_time(self.access_time)
    }
}

/// Truncates `path` to [`MAX_RELATIVE_PATH_BYTES`] on a character boundary.
pub(crate) fn bounded_path(mut path: String) -> String {
    if path.len() > MAX_RELATIVE_PATH_BYTES {
        let mut end = MAX_RELATIVE_PATH_BYTES;
        while !path.is_char_boundary(end) {
            end -= 1;
        }
        path.truncate(end);
    }
    path
}

/// Converts FILETIME ticks to a `SystemTime`. Zero means "not reported".
pub fn filetime_to_system_time(ticks: u64) -> Option<SystemTime> {
    if ticks == 0 {
        return None;
    }
    if ticks >= FILETIME_UNIX_OFFSET {
        let since_epoch = ticks - FILETIME_UNIX_OFFSET;
        UNIX_EPOCH.checked_add(ticks_to_duration(since_epoch))
    } else {
        UNIX_EPOCH.checked_sub(ticks_to_duration(FILETIME_UNIX_OFFSET - ticks))
    }
}

/// Converts a `SystemTime` to FILETIME ticks, clamping pre-1601 times to 0.
pub fn system_time_to_filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => FILETIME_UNIX_OFFSET.saturating_add(duration_to_ticks(after)),
        Err(before) => FILETIME_UNIX_OFFSET.saturating_sub(duration_to_ticks(before.duration())),
    }
}

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::new(ticks / 10_000_000, ((ticks % 10_000_000) * 100) as u32)
}

fn duration_to_ticks(d: Duration) -> u64 {
    d.as_secs()
        .saturating_mul(10_000_000)
        .saturating_add(u64::from(d.subsec_nanos() / 100))
}
