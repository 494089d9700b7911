//! Per-directory read state

use crate::error::WatchError;
use crate::raw::ChangeFilter;
use crate::source::{DirHandle, NotifySource, ReadOp, WatchId};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};

const BACKSLASH: u16 = b'\\' as u16;
const SLASH: u16 = b'/' as u16;

/// One watched directory's ping-pong buffers and handle.
///
/// Exactly one buffer is lent to the source while a read is in flight; the
/// other holds the most recently completed batch. `buffer_index` names the
/// buffer the next read will use and flips once per issued read.
#[derive(Debug)]
pub(crate) struct ReadRequest {
    id: WatchId,
    handle: DirHandle,
    buffers: [Vec<u8>; 2],
    buffer_size: usize,
    buffer_index: usize,
    /// Directory path as UTF-16, the encoding raw entry names use
    directory: Vec<u16>,
    display_path: PathBuf,
    separator: u16,
    recursive: bool,
    in_flight: bool,
}

impl ReadRequest {
    /// Build a request for an already opened `handle`.
    ///
    /// `directory` is `path` as produced by [`encode_wide`].
    pub(crate) fn new(
        id: WatchId,
        handle: DirHandle,
        path: &Path,
        directory: Vec<u16>,
        recursive: bool,
        buffer_size: usize,
    ) -> Self {
        let separator = separator_for(&directory);
        Self {
            id,
            handle,
            buffers: [vec![0; buffer_size], vec![0; buffer_size]],
            buffer_size,
            buffer_index: 0,
            directory,
            display_path: path.to_path_buf(),
            separator,
            recursive,
            in_flight: false,
        }
    }

    pub(crate) fn id(&self) -> WatchId {
        self.id
    }

    pub(crate) fn handle(&self) -> DirHandle {
        self.handle
    }

    pub(crate) fn directory(&self) -> &[u16] {
        &self.directory
    }

    pub(crate) fn separator(&self) -> u16 {
        self.separator
    }

    pub(crate) fn display_path(&self) -> &Path {
        &self.display_path
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Lend the idle buffer to `source` and start the next read.
    ///
    /// Flips the buffer toggle whether or not the source accepts the read.
    pub(crate) fn issue(&mut self, source: &dyn NotifySource, filter: ChangeFilter) -> io::Result<()> {
        let index = self.buffer_index;
        self.buffer_index ^= 1;

        let mut buffer = mem::take(&mut self.buffers[index]);
        // A buffer that was handed back short is restored to full size
        buffer.resize(self.buffer_size, 0);

        source.read(ReadOp {
            handle: self.handle,
            token: self.id,
            buffer,
            recursive: self.recursive,
            filter,
        })?;
        self.in_flight = true;
        Ok(())
    }

    /// Take back the buffer of a completed read and return its slot.
    pub(crate) fn restore(&mut self, buffer: Vec<u8>) -> usize {
        let slot = self.buffer_index ^ 1;
        self.buffers[slot] = buffer;
        self.in_flight = false;
        slot
    }

    /// The first `bytes` of the buffer in `slot`
    pub(crate) fn filled(&self, slot: usize, bytes: usize) -> &[u8] {
        let buffer = &self.buffers[slot];
        &buffer[..bytes.min(buffer.len())]
    }
}

/// Directory path in the UTF-16 encoding raw entries use.
#[cfg(windows)]
pub(crate) fn encode_wide(path: &Path) -> Result<Vec<u16>, WatchError> {
    use std::os::windows::ffi::OsStrExt;
    Ok(path.as_os_str().encode_wide().collect())
}

/// Directory path in the UTF-16 encoding raw entries use.
#[cfg(not(windows))]
pub(crate) fn encode_wide(path: &Path) -> Result<Vec<u16>, WatchError> {
    path.to_str()
        .map(|s| s.encode_utf16().collect())
        .ok_or_else(|| WatchError::InvalidPath(path.to_path_buf()))
}

/// Separator to join names with, following the style of the directory path.
///
/// Backslash wins if present, then forward slash, then the platform default.
fn separator_for(directory: &[u16]) -> u16 {
    if directory.contains(&BACKSLASH) {
        BACKSLASH
    } else if directory.contains(&SLASH) {
        SLASH
    } else {
        std::path::MAIN_SEPARATOR as u16
    }
}

/// Whether `unit` terminates a path component
pub(crate) fn is_separator(unit: u16) -> bool {
    unit == BACKSLASH || unit == SLASH
}
