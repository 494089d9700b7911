//! Notification source built on the `notify` crate
//!
//! `notify` pushes events from its own thread at any time, while the engine
//! expects the read/complete contract of `ReadDirectoryChangesExW`. Each
//! directory keeps a backlog of encoded entries:
//! - events are appended to the backlog as they arrive
//! - a pending read is completed as soon as the backlog is non-empty
//! - a backlog larger than the read buffer is dropped and reported as an
//!   overflow (a successful completion with zero bytes)
//! - `notify` rescan flags are reported as overflows too
//! - a watcher error, or the root itself going away, fails the pending read
//!   so the engine stops watching the directory

use super::{Completion, CompletionSink, CompletionStatus, DirHandle, NotifySource, ReadOp};
use crate::raw::{self, ChangeFilter, EntryBuilder};
use crate::record::system_time_to_filetime;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Action code for events `notify` cannot classify
const ACTION_UNKNOWN: u32 = 0;

/// Failure code when the watched root was deleted or moved away (ENOENT)
const ROOT_GONE: i32 = 2;

/// Failure code for watcher errors that carry no OS error (EIO)
const WATCHER_FAILED: i32 = 5;

/// [`NotifySource`] backed by the platform's recommended `notify` watcher
pub struct NotifyBackend {
    inner: Arc<Inner>,
    next_handle: AtomicU64,
}

struct Inner {
    dirs: Mutex<HashMap<DirHandle, DirState>>,
    sink: Mutex<Option<CompletionSink>>,
}

/// Per-directory emulation state
struct DirState {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    /// Started by the first read, like the kernel-side buffer on Windows
    watcher: Option<RecommendedWatcher>,
    filter: ChangeFilter,
    pending: Option<ReadOp>,
    backlog: Vec<EntryBuilder>,
    backlog_bytes: usize,
    /// Bytes the backlog may hold; the first read's buffer size
    capacity: usize,
    overflowed: bool,
    /// Set once the directory can no longer be watched; sticky
    failed: Option<i32>,
}

impl NotifyBackend {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                dirs: Mutex::new(HashMap::new()),
                sink: Mutex::new(None),
            }),
            next_handle: AtomicU64::new(1),
        })
    }
}

impl NotifySource for NotifyBackend {
    fn bind(&self, sink: CompletionSink) {
        *self.inner.sink.lock() = Some(sink);
    }

    fn open(&self, path: &Path) -> io::Result<DirHandle> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a directory", path.display()),
            ));
        }

        let handle = DirHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let state = DirState {
            root: path.to_path_buf(),
            canonical_root: fs::canonicalize(path).ok(),
            watcher: None,
            filter: ChangeFilter::DEFAULT,
            pending: None,
            backlog: Vec::new(),
            backlog_bytes: 0,
            capacity: 0,
            overflowed: false,
            failed: None,
        };
        self.inner.dirs.lock().insert(handle, state);
        Ok(handle)
    }

    fn read(&self, op: ReadOp) -> io::Result<()> {
        let handle = op.handle;
        let completion = {
            let mut dirs = self.inner.dirs.lock();
            let state = dirs
                .get_mut(&handle)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown directory handle"))?;

            if state.watcher.is_none() {
                state.capacity = op.buffer.len();
                state.filter = op.filter;
                let mode = if op.recursive {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                state.watcher = Some(start_watcher(&self.inner, handle, &state.root, mode)?);
                debug!("Started notify watcher for {}", state.root.display());
            }

            state.pending = Some(op);
            state.flush()
        };

        if let Some(completion) = completion {
            self.inner.deliver(completion);
        }
        Ok(())
    }

    fn cancel(&self, handle: DirHandle) {
        let (completion, watcher) = match self.inner.dirs.lock().get_mut(&handle) {
            Some(state) => (state.pending.take().map(Completion::aborted), state.watcher.take()),
            None => (None, None),
        };
        // Dropped outside the lock: the watcher's thread may be waiting on it
        drop(watcher);

        if let Some(completion) = completion {
            self.inner.deliver(completion);
        }
    }

    fn close(&self, handle: DirHandle) {
        let state = self.inner.dirs.lock().remove(&handle);
        drop(state);
    }
}

impl Inner {
    fn deliver(&self, completion: Completion) {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.complete(completion);
            }
            None => warn!("Completion for {} dropped: no sink bound", completion.token),
        }
    }
}

impl DirState {
    fn push(&mut self, entry: EntryBuilder) {
        if self.overflowed || self.failed.is_some() {
            return;
        }
        let len = entry.encoded_len();
        if self.backlog_bytes + len > self.capacity {
            self.mark_overflow();
            return;
        }
        self.backlog_bytes += len;
        self.backlog.push(entry);
    }

    fn mark_failed(&mut self, code: i32) {
        if self.failed.is_none() {
            debug!("Watch on {} failed with OS error {}", self.root.display(), code);
            self.failed = Some(code);
        }
        self.backlog.clear();
        self.backlog_bytes = 0;
    }

    fn mark_overflow(&mut self) {
        self.overflowed = true;
        self.backlog.clear();
        self.backlog_bytes = 0;
    }

    /// Complete the pending read if there is anything to report.
    fn flush(&mut self) -> Option<Completion> {
        if let Some(code) = self.failed {
            let op = self.pending.take()?;
            return Some(Completion {
                token: op.token,
                status: CompletionStatus::Failed(code),
                bytes: 0,
                buffer: op.buffer,
            });
        }
        if self.backlog.is_empty() && !self.overflowed {
            return None;
        }
        let mut op = self.pending.take()?;

        let bytes = if self.overflowed {
            0
        } else {
            // The backlog is bounded by the buffer size, so this only fails
            // if a later read lent a smaller buffer
            raw::encode(&self.backlog, &mut op.buffer).unwrap_or(0)
        };
        self.backlog.clear();
        self.backlog_bytes = 0;
        self.overflowed = false;

        Some(Completion {
            token: op.token,
            status: CompletionStatus::Success,
            bytes,
            buffer: op.buffer,
        })
    }

    fn is_root(&self, path: &Path) -> bool {
        path == self.root || self.canonical_root.as_deref() == Some(path)
    }

    /// Whether `event` reports the root itself being deleted or moved away
    fn root_gone(&self, event: &Event) -> bool {
        let removal = matches!(
            event.kind,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
        );
        removal && event.paths.iter().any(|p| self.is_root(p)) && !self.root.exists()
    }

    /// Whether a watcher error affects the whole directory rather than one
    /// entry below it
    fn fatal_error(&self, error: &notify::Error) -> bool {
        error.paths.is_empty() || error.paths.iter().any(|p| self.is_root(p))
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let relative = path
            .strip_prefix(&self.root)
            .ok()
            .or_else(|| {
                self.canonical_root
                    .as_deref()
                    .and_then(|root| path.strip_prefix(root).ok())
            })?;
        let name = relative.to_string_lossy();
        if name.is_empty() {
            None
        } else {
            Some(name.into_owned())
        }
    }
}

fn start_watcher(
    inner: &Arc<Inner>,
    handle: DirHandle,
    root: &Path,
    mode: RecursiveMode,
) -> io::Result<RecommendedWatcher> {
    // Weak, since the watcher (and this closure) is owned by `inner`
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| {
            if let Some(inner) = weak.upgrade() {
                handle_event(&inner, handle, result);
            }
        },
        Config::default(),
    )
    .map_err(to_io_error)?;
    watcher.watch(root, mode).map_err(to_io_error)?;
    Ok(watcher)
}

fn handle_event(inner: &Inner, handle: DirHandle, result: notify::Result<Event>) {
    let completion = {
        let mut dirs = inner.dirs.lock();
        let Some(state) = dirs.get_mut(&handle) else {
            return;
        };

        match result {
            Err(e) if state.fatal_error(&e) => state.mark_failed(error_code(&e)),
            Err(e) => warn!("notify error under {}: {}", state.root.display(), e),
            Ok(event) if state.root_gone(&event) => state.mark_failed(ROOT_GONE),
            Ok(event) if event.need_rescan() => state.mark_overflow(),
            Ok(event) => {
                for entry in entries_for(&event, state) {
                    state.push(entry);
                }
            }
        }
        state.flush()
    };

    if let Some(completion) = completion {
        inner.deliver(completion);
    }
}

fn error_code(error: &notify::Error) -> i32 {
    match &error.kind {
        notify::ErrorKind::Io(e) => e.raw_os_error().unwrap_or(WATCHER_FAILED),
        notify::ErrorKind::PathNotFound => ROOT_GONE,
        _ => WATCHER_FAILED,
    }
}

/// Translate one `notify` event into raw entries.
fn entries_for(event: &Event, state: &DirState) -> Vec<EntryBuilder> {
    let (action, folder_hint) = match &event.kind {
        EventKind::Create(kind) => (raw::ACTION_ADDED, matches!(kind, CreateKind::Folder)),
        EventKind::Remove(kind) => (raw::ACTION_REMOVED, matches!(kind, RemoveKind::Folder)),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => (raw::ACTION_RENAMED_OLD_NAME, false),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => (raw::ACTION_RENAMED_NEW_NAME, false),
        // Both halves were already reported individually
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Vec::new(),
        EventKind::Modify(ModifyKind::Name(_)) => {
            return event
                .paths
                .iter()
                .filter_map(|path| {
                    let action = if path.exists() {
                        raw::ACTION_RENAMED_NEW_NAME
                    } else {
                        raw::ACTION_RENAMED_OLD_NAME
                    };
                    build_entry(state, path, action, false)
                })
                .collect();
        }
        EventKind::Modify(_) => (raw::ACTION_MODIFIED, false),
        EventKind::Access(_) => return Vec::new(),
        EventKind::Any | EventKind::Other => (ACTION_UNKNOWN, false),
    };

    event
        .paths
        .iter()
        .filter_map(|path| build_entry(state, path, action, folder_hint))
        .collect()
}

fn build_entry(state: &DirState, path: &Path, action: u32, folder_hint: bool) -> Option<EntryBuilder> {
    if !wanted(state.filter, action) {
        return None;
    }
    let name = state.relative_name(path)?;
    let mut entry = EntryBuilder::new(action, &name);

    match fs::symlink_metadata(path) {
        Ok(metadata) => fill_metadata(&mut entry, &metadata),
        Err(_) if folder_hint => entry.attributes = raw::ATTRIBUTE_DIRECTORY,
        Err(_) => {}
    }

    trace!("Raw entry {:#x} {}", action, name);
    Some(entry)
}

fn wanted(filter: ChangeFilter, action: u32) -> bool {
    let names = ChangeFilter::FILE_NAME | ChangeFilter::DIR_NAME;
    match action {
        raw::ACTION_ADDED => {
            filter.bits() & (names | ChangeFilter::CREATION).bits() != 0
        }
        raw::ACTION_REMOVED | raw::ACTION_RENAMED_OLD_NAME | raw::ACTION_RENAMED_NEW_NAME => {
            filter.bits() & names.bits() != 0
        }
        raw::ACTION_MODIFIED => filter.contains(ChangeFilter::LAST_WRITE),
        _ => true,
    }
}

fn fill_metadata(entry: &mut EntryBuilder, metadata: &fs::Metadata) {
    let ticks = |time: io::Result<std::time::SystemTime>| time.map(system_time_to_filetime).unwrap_or(0);

    entry.creation_time = ticks(metadata.created());
    entry.modification_time = ticks(metadata.modified());
    entry.access_time = ticks(metadata.accessed());
    entry.change_time = change_time(metadata).unwrap_or(entry.modification_time);
    entry.size = if metadata.is_dir() { 0 } else { metadata.len() };

    let mut attributes = 0;
    if metadata.is_dir() {
        attributes |= raw::ATTRIBUTE_DIRECTORY;
    }
    if metadata.permissions().readonly() {
        attributes |= raw::ATTRIBUTE_READONLY;
    }
    entry.attributes = if attributes == 0 {
        raw::ATTRIBUTE_NORMAL
    } else {
        attributes
    };
}

#[cfg(unix)]
fn change_time(metadata: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    use std::time::{Duration, UNIX_EPOCH};

    let secs = u64::try_from(metadata.ctime()).ok()?;
    let nanos = u32::try_from(metadata.ctime_nsec()).ok()?;
    Some(system_time_to_filetime(UNIX_EPOCH + Duration::new(secs, nanos)))
}

#[cfg(not(unix))]
fn change_time(_metadata: &fs::Metadata) -> Option<u64> {
    None
}

fn to_io_error(e: notify::Error) -> io::Error {
    let message = e.to_string();
    match e.kind {
        notify::ErrorKind::Io(io) => io,
        _ => io::Error::new(io::ErrorKind::Other, message),
    }
}
