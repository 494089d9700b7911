//! Notification engine
//!
//! Runs on the dedicated notification thread and owns every [`ReadRequest`].
//! Registrations, the shutdown command and read completions all arrive on one
//! channel and are handled one at a time, so request state needs no locking.
//!
//! Per request the cycle is: issue a read, wait for its completion, reissue
//! on the other buffer, then decode the batch that just arrived. Reissuing
//! first keeps a read outstanding while decoding, so no change window closes.
//! During shutdown each in-flight read is cancelled and the request is freed
//! when its completion comes back.

use crate::queue::EventQueue;
use crate::raw::{self, ChangeFilter, RawEntry, RawError};
use crate::record::{bounded_path, ChangeRecord, FileAction};
use crate::request::{is_separator, ReadRequest};
use crate::source::{Completion, CompletionStatus, NotifySource, WatchId};
use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Work items for the notification thread
pub(crate) enum Message {
    /// Start watching a freshly opened directory
    Watch(ReadRequest),
    /// Cancel every outstanding read
    Shutdown,
    /// A read finished
    Completion(Completion),
}

/// State shared between the calling thread and the notification thread
#[derive(Debug, Default)]
pub(crate) struct Shared {
    terminating: AtomicBool,
    /// Requests registered but not yet released
    outstanding: AtomicUsize,
}

impl Shared {
    pub(crate) fn begin_terminate(&self) {
        self.terminating.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// The notification thread's state
pub(crate) struct Engine {
    source: Arc<dyn NotifySource>,
    queue: Arc<EventQueue>,
    shared: Arc<Shared>,
    requests: HashMap<WatchId, ReadRequest>,
    filter: ChangeFilter,
}

impl Engine {
    pub(crate) fn new(
        source: Arc<dyn NotifySource>,
        queue: Arc<EventQueue>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            source,
            queue,
            shared,
            requests: HashMap::new(),
            filter: ChangeFilter::DEFAULT,
        }
    }

    /// Process messages until shutdown has been requested and every request
    /// has been released.
    pub(crate) fn run(mut self, rx: Receiver<Message>) {
        debug!("Notification thread started");

        while !self.finished() {
            match rx.recv() {
                Ok(message) => self.dispatch(message),
                Err(_) => {
                    warn!("Notification channel closed with {} requests live", self.requests.len());
                    break;
                }
            }
        }

        debug!("Notification thread exiting");
    }

    fn finished(&self) -> bool {
        self.shared.is_terminating() && self.shared.outstanding() == 0
    }

    pub(crate) fn dispatch(&mut self, message: Message) {
        match message {
            Message::Watch(request) => self.register(request),
            Message::Shutdown => self.cancel_all(),
            Message::Completion(completion) => self.complete(completion),
        }
    }

    /// Issue the first read for a new request.
    fn register(&mut self, mut request: ReadRequest) {
        if self.shared.is_terminating() {
            debug!("Dropping registration {} during shutdown", request.id());
            self.release(request);
            return;
        }

        match request.issue(&*self.source, self.filter) {
            Ok(()) => {
                debug!(
                    "Watching {} as {}",
                    request.display_path().display(),
                    request.id()
                );
                self.requests.insert(request.id(), request);
            }
            Err(e) => {
                error!(
                    "Failed to start reading {}: {}",
                    request.display_path().display(),
                    e
                );
                self.release(request);
            }
        }
    }

    /// Handle a finished read: tear down, or reissue and decode.
    fn complete(&mut self, completion: Completion) {
        let Some(mut request) = self.requests.remove(&completion.token) else {
            warn!("Completion for unknown request {}", completion.token);
            return;
        };
        let slot = request.restore(completion.buffer);

        if completion.status == CompletionStatus::Aborted || self.shared.is_terminating() {
            self.release(request);
            return;
        }

        if let CompletionStatus::Failed(code) = completion.status {
            // Usually the watched directory was deleted or became inaccessible
            error!(
                "Read on {} failed with OS error {}; no longer watching it",
                request.display_path().display(),
                code
            );
            self.release(request);
            return;
        }

        // Keep a read outstanding while this batch is decoded
        let reissued = match request.issue(&*self.source, self.filter) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Failed to reissue read on {}: {}",
                    request.display_path().display(),
                    e
                );
                false
            }
        };

        if completion.bytes == 0 {
            warn!(
                "Change buffer for {} overflowed; changes were lost",
                request.display_path().display()
            );
            self.queue.push(overflow_record(request.directory()));
        } else {
            let batch = request.filled(slot, completion.bytes);
            if let Err(e) = decode_batch(batch, request.directory(), request.separator(), &self.queue) {
                warn!(
                    "Malformed change batch for {}: {}",
                    request.display_path().display(),
                    e
                );
            }
        }

        if reissued {
            self.requests.insert(request.id(), request);
        } else {
            self.release(request);
        }
    }

    /// Cancel all in-flight reads; their completions free the requests.
    fn cancel_all(&mut self) {
        debug!("Cancelling {} outstanding reads", self.requests.len());
        for request in self.requests.values().filter(|r| r.in_flight()) {
            self.source.cancel(request.handle());
        }
    }

    /// Close the handle and drop the request. No read may be in flight.
    fn release(&self, request: ReadRequest) {
        debug_assert!(!request.in_flight());
        self.source.close(request.handle());
        self.shared.release();
        debug!("Released {}", request.id());
    }

    #[cfg(test)]
    pub(crate) fn live_requests(&self) -> usize {
        self.requests.len()
    }
}

/// Decode a filled buffer into the queue, preserving entry order.
///
/// Returns the number of records pushed. On a malformed entry, records
/// decoded before it stay queued.
pub fn decode_batch(
    batch: &[u8],
    directory: &[u16],
    separator: u16,
    queue: &EventQueue,
) -> Result<usize, RawError> {
    let mut pushed = 0;
    for entry in raw::entries(batch) {
        let record = to_record(&entry?, directory, separator);
        trace!("Change: {:?} {}", record.action, record.path);
        queue.push(record);
        pushed += 1;
    }
    Ok(pushed)
}

/// Record reported when a directory's buffer overflowed
pub(crate) fn overflow_record(directory: &[u16]) -> ChangeRecord {
    ChangeRecord::too_many_changes(String::from_utf16_lossy(directory))
}

fn to_record(entry: &RawEntry<'_>, directory: &[u16], separator: u16) -> ChangeRecord {
    let mut combined = Vec::with_capacity(directory.len() + 1 + 64);
    combined.extend_from_slice(directory);
    if matches!(combined.last(), Some(&unit) if !is_separator(unit)) {
        combined.push(separator);
    }
    combined.extend(entry.name_wide());

    ChangeRecord {
        path: bounded_path(String::from_utf16_lossy(&combined)),
        action: action_from_raw(entry.action),
        is_directory: entry.attributes & raw::ATTRIBUTE_DIRECTORY != 0,
        creation_time: entry.creation_time,
        modification_time: entry.modification_time,
        change_time: entry.change_time,
        access_time: entry.access_time,
        size: entry.size,
        attributes: entry.attributes,
    }
}

fn action_from_raw(code: u32) -> FileAction {
    match code {
        raw::ACTION_ADDED => FileAction::Added,
        raw::ACTION_REMOVED => FileAction::Removed,
        raw::ACTION_MODIFIED => FileAction::Modified,
        raw::ACTION_RENAMED_OLD_NAME => FileAction::RenamedFrom,
        raw::ACTION_RENAMED_NEW_NAME => FileAction::RenamedTo,
        _ => FileAction::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::{EntryBuilder, ACTION_ADDED, ACTION_MODIFIED, ACTION_REMOVED};
    use crate::request::encode_wide;
    use crate::source::scripted::ScriptedSource;
    use crate::source::{CompletionSink, DirHandle};
    use crossbeam_channel::unbounded;
    use std::path::Path;

    struct Harness {
        engine: Engine,
        source: Arc<ScriptedSource>,
        queue: Arc<EventQueue>,
        shared: Arc<Shared>,
        rx: Receiver<Message>,
        next_id: u64,
    }

    impl Harness {
        fn new() -> Self {
            let source = Arc::new(ScriptedSource::default());
            let queue = Arc::new(EventQueue::new(4, 2));
            let shared = Arc::new(Shared::default());
            let (tx, rx) = unbounded();
            source.bind_sink(CompletionSink::new(tx));
            source.observe(Arc::clone(&queue));
            let engine = Engine::new(
                Arc::clone(&source) as Arc<dyn NotifySource>,
                Arc::clone(&queue),
                Arc::clone(&shared),
            );
            Self {
                engine,
                source,
                queue,
                shared,
                rx,
                next_id: 1,
            }
        }

        /// Register `path` the way the watcher does
        fn watch(&mut self, path: &str, buffer_size: usize) -> DirHandle {
            self.source.allow(path);
            let handle = self.source.open_path(path).unwrap();
            let id = WatchId(self.next_id);
            self.next_id += 1;
            let p = Path::new(path);
            let request = ReadRequest::new(id, handle, p, encode_wide(p).unwrap(), true, buffer_size);
            self.shared.acquire();
            self.engine.dispatch(Message::Watch(request));
            handle
        }

        /// Feed everything the source sent into the engine
        fn pump(&mut self) {
            while let Ok(message) = self.rx.try_recv() {
                self.engine.dispatch(message);
            }
        }

        fn drain(&self) -> Vec<ChangeRecord> {
            std::iter::from_fn(|| self.queue.pop()).collect()
        }
    }

    #[test]
    fn test_register_issues_first_read() {
        let mut h = Harness::new();
        let handle = h.watch("assets", 256);

        assert!(h.source.has_pending(handle));
        assert_eq!(h.source.reads_issued(), 1);
        assert_eq!(h.shared.outstanding(), 1);
        assert_eq!(h.engine.live_requests(), 1);
    }

    #[test]
    fn test_batch_preserves_entry_order() {
        let mut h = Harness::new();
        let handle = h.watch("assets", 1024);

        let completion = h.source.fill(
            handle,
            &[
                EntryBuilder::new(ACTION_ADDED, "one.txt"),
                EntryBuilder::new(ACTION_MODIFIED, "two.txt"),
                EntryBuilder::new(ACTION_REMOVED, "three.txt"),
            ],
        );
        h.engine.dispatch(Message::Completion(completion));

        let summary: Vec<_> = h.drain().into_iter().map(|r| (r.action, r.path)).collect();
        let sep = std::path::MAIN_SEPARATOR;
        assert_eq!(
            summary,
            vec![
                (FileAction::Added, format!("assets{}one.txt", sep)),
                (FileAction::Modified, format!("assets{}two.txt", sep)),
                (FileAction::Removed, format!("assets{}three.txt", sep)),
            ]
        );
    }

    #[test]
    fn test_reissue_happens_before_decode() {
        let mut h = Harness::new();
        let handle = h.watch("assets", 1024);

        let completion = h.source.fill(
            handle,
            &[
                EntryBuilder::new(ACTION_ADDED, "a"),
                EntryBuilder::new(ACTION_ADDED, "b"),
            ],
        );
        h.engine.dispatch(Message::Completion(completion));

        // The second read saw an empty queue: it was issued before decoding
        assert_eq!(h.source.queue_len_at_reads(), vec![0, 0]);
        assert_eq!(h.queue.len(), 2);
        assert!(h.source.has_pending(handle));
    }

    #[test]
    fn test_buffers_alternate_between_reads() {
        let mut h = Harness::new();
        let handle = h.watch("assets", 512);

        for _ in 0..3 {
            let completion = h.source.fill(handle, &[EntryBuilder::new(ACTION_MODIFIED, "f")]);
            h.engine.dispatch(Message::Completion(completion));
        }

        let buffers = h.source.buffer_ids();
        assert_eq!(buffers.len(), 4);
        assert_ne!(buffers[0], buffers[1]);
        assert_eq!(buffers[0], buffers[2]);
        assert_eq!(buffers[1], buffers[3]);
    }

    #[test]
    fn test_overflow_yields_single_too_many_changes() {
        let mut h = Harness::new();
        let handle = h.watch("data/assets", 128);

        let completion = h.source.overflow(handle);
        h.engine.dispatch(Message::Completion(completion));

        let records = h.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, FileAction::TooManyChanges);
        assert!(records[0].is_directory);
        assert_eq!(records[0].path, "data/assets");

        // Overflow is not fatal: the request keeps reading
        assert!(h.source.has_pending(handle));
        assert_eq!(h.engine.live_requests(), 1);
    }

    #[test]
    fn test_path_reconstruction_with_backslashes() {
        let queue = EventQueue::default();
        let directory: Vec<u16> = r"C:\assets".encode_utf16().collect();
        let mut buffer = vec![0u8; 512];
        let written = raw::encode(
            &[EntryBuilder::new(ACTION_MODIFIED, r"textures\wall.png")],
            &mut buffer,
        )
        .unwrap();

        decode_batch(&buffer[..written], &directory, b'\\' as u16, &queue).unwrap();
        assert_eq!(queue.pop().unwrap().path, r"C:\assets\textures\wall.png");
    }

    #[test]
    fn test_trailing_separator_is_not_doubled() {
        let queue = EventQueue::default();
        let directory: Vec<u16> = "data/".encode_utf16().collect();
        let mut buffer = vec![0u8; 512];
        let written = raw::encode(&[EntryBuilder::new(ACTION_ADDED, "x.txt")], &mut buffer).unwrap();

        decode_batch(&buffer[..written], &directory, b'/' as u16, &queue).unwrap();
        assert_eq!(queue.pop().unwrap().path, "data/x.txt");
    }

    #[test]
    fn test_unknown_action_is_kept_as_none() {
        let queue = EventQueue::default();
        let directory: Vec<u16> = "d".encode_utf16().collect();
        let mut entry = EntryBuilder::new(0x42, "odd");
        entry.size = 99;
        entry.modification_time = 1234;
        entry.attributes = raw::ATTRIBUTE_DIRECTORY;
        let mut buffer = vec![0u8; 512];
        let written = raw::encode(&[entry], &mut buffer).unwrap();

        assert_eq!(decode_batch(&buffer[..written], &directory, b'/' as u16, &queue), Ok(1));
        let record = queue.pop().unwrap();
        assert_eq!(record.action, FileAction::None);
        assert_eq!(record.size, 99);
        assert_eq!(record.modification_time, 1234);
        assert!(record.is_directory);
    }

    #[test]
    fn test_malformed_batch_keeps_decoded_prefix() {
        let queue = EventQueue::default();
        let directory: Vec<u16> = "d".encode_utf16().collect();
        let mut buffer = vec![0u8; 512];
        let written = raw::encode(
            &[
                EntryBuilder::new(ACTION_ADDED, "good"),
                EntryBuilder::new(ACTION_ADDED, "cut-off"),
            ],
            &mut buffer,
        )
        .unwrap();

        let result = decode_batch(&buffer[..written - 2], &directory, b'/' as u16, &queue);
        assert!(matches!(result, Err(RawError::Truncated { .. })));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().path, "d/good");
    }

    #[test]
    fn test_failed_read_releases_request() {
        let mut h = Harness::new();
        let handle = h.watch("assets", 256);

        let completion = h.source.fail(handle, 5);
        h.engine.dispatch(Message::Completion(completion));

        assert!(h.queue.is_empty());
        assert!(!h.source.has_pending(handle));
        assert!(h.source.is_closed(handle));
        assert_eq!(h.shared.outstanding(), 0);
        assert_eq!(h.engine.live_requests(), 0);
    }

    #[test]
    fn test_rejected_first_read_releases_request() {
        let mut h = Harness::new();
        h.source.set_fail_reads(true);
        let handle = h.watch("assets", 256);

        assert!(h.source.is_closed(handle));
        assert_eq!(h.shared.outstanding(), 0);
        assert_eq!(h.engine.live_requests(), 0);
    }

    #[test]
    fn test_shutdown_cancels_and_releases_everything() {
        let mut h = Harness::new();
        let first = h.watch("one", 256);
        let second = h.watch("two", 256);

        h.shared.begin_terminate();
        h.engine.dispatch(Message::Shutdown);
        h.pump();

        assert!(h.source.is_closed(first));
        assert!(h.source.is_closed(second));
        assert_eq!(h.shared.outstanding(), 0);
        assert_eq!(h.engine.live_requests(), 0);
        assert!(h.engine.finished());
    }

    #[test]
    fn test_completion_racing_shutdown_is_not_decoded() {
        let mut h = Harness::new();
        let handle = h.watch("assets", 256);

        // The read finished before the cancel reached the source
        let completion = h.source.fill(handle, &[EntryBuilder::new(ACTION_ADDED, "late")]);
        h.shared.begin_terminate();
        h.engine.dispatch(Message::Shutdown);
        h.engine.dispatch(Message::Completion(completion));

        assert!(h.queue.is_empty());
        assert!(h.source.is_closed(handle));
        assert_eq!(h.shared.outstanding(), 0);
    }

    #[test]
    fn test_registration_during_shutdown_is_released() {
        let mut h = Harness::new();
        h.shared.begin_terminate();
        let handle = h.watch("assets", 256);

        assert_eq!(h.source.reads_issued(), 0);
        assert!(h.source.is_closed(handle));
        assert_eq!(h.shared.outstanding(), 0);
    }

    #[test]
    fn test_unknown_completion_is_ignored() {
        let mut h = Harness::new();
        h.engine.dispatch(Message::Completion(Completion {
            token: WatchId(99),
            status: CompletionStatus::Success,
            bytes: 0,
            buffer: Vec::new(),
        }));
        assert!(h.queue.is_empty());
    }
}
