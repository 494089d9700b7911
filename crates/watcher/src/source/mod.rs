//! Asynchronous directory-change notification sources
//!
//! A [`NotifySource`] is the OS collaborator the engine drives: it opens
//! directories, accepts one outstanding read per directory, and reports every
//! read exactly once through a [`CompletionSink`], including reads that end
//! because they were cancelled.
//!
//! Buffers change hands with each read: the engine lends the active buffer in
//! [`ReadOp`] and gets it back, filled with raw entries (see [`crate::raw`]),
//! in the matching [`Completion`].

use crate::engine::Message;
use crate::raw::ChangeFilter;
use crossbeam_channel::Sender;
use std::fmt;
use std::io;
use std::path::Path;

#[cfg(not(windows))]
pub mod portable;
#[cfg(windows)]
pub mod windows;

#[cfg(test)]
pub(crate) mod scripted;

/// Source used by [`crate::Watcher::initialize`] on this platform
#[cfg(not(windows))]
pub type PlatformSource = portable::NotifyBackend;

/// Source used by [`crate::Watcher::initialize`] on this platform
#[cfg(windows)]
pub type PlatformSource = windows::DirectoryChangesSource;

/// Identity of one registered directory; doubles as the completion token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub(crate) u64);

impl WatchId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque directory handle minted by a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle(u64);

impl DirHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// One asynchronous read request
#[derive(Debug)]
pub struct ReadOp {
    pub handle: DirHandle,
    pub token: WatchId,
    /// Buffer to fill; its length is the read size
    pub buffer: Vec<u8>,
    pub recursive: bool,
    pub filter: ChangeFilter,
}

/// How a read ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Entries were written; zero bytes means the source's buffer overflowed
    Success,
    /// The read was cancelled
    Aborted,
    /// Any other OS error code
    Failed(i32),
}

/// A finished read, carrying the lent buffer back
#[derive(Debug)]
pub struct Completion {
    pub token: WatchId,
    pub status: CompletionStatus,
    /// Valid bytes at the start of `buffer`
    pub bytes: usize,
    pub buffer: Vec<u8>,
}

impl Completion {
    /// Cancelled read returning `op`'s buffer untouched
    pub fn aborted(op: ReadOp) -> Self {
        Self {
            token: op.token,
            status: CompletionStatus::Aborted,
            bytes: 0,
            buffer: op.buffer,
        }
    }
}

/// Delivery channel from a source into the notification thread
#[derive(Clone)]
pub struct CompletionSink {
    tx: Sender<Message>,
}

impl CompletionSink {
    pub(crate) fn new(tx: Sender<Message>) -> Self {
        Self { tx }
    }

    /// Hand a completion to the notification thread.
    ///
    /// Returns false once the thread has exited; the completion is dropped.
    pub fn complete(&self, completion: Completion) -> bool {
        self.tx.send(Message::Completion(completion)).is_ok()
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSink").finish_non_exhaustive()
    }
}

/// Cancelable, buffer-based directory change notifications.
///
/// `open` runs on the registering thread; `read`, `cancel` and `close` run
/// on the notification thread. Implementations must deliver exactly one
/// [`Completion`] per accepted `read`.
pub trait NotifySource: Send + Sync + 'static {
    /// Attach the sink completions are delivered to. Called once, before any
    /// other method.
    fn bind(&self, sink: CompletionSink);

    /// Open `path` for watching with share-everything semantics.
    fn open(&self, path: &Path) -> io::Result<DirHandle>;

    /// Start an asynchronous read. On error no completion is delivered.
    fn read(&self, op: ReadOp) -> io::Result<()>;

    /// Cancel the outstanding read on `handle`, if any. The cancelled read
    /// completes with [`CompletionStatus::Aborted`].
    fn cancel(&self, handle: DirHandle);

    /// Release `handle`. No read may be outstanding on it.
    fn close(&self, handle: DirHandle);
}
