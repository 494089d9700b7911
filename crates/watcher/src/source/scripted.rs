//! Deterministic source for driving the engine in tests

use super::{
    Completion, CompletionSink, CompletionStatus, DirHandle, NotifySource, ReadOp,
};
use crate::queue::EventQueue;
use crate::raw::{self, EntryBuilder};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct ScriptedSource {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    sink: Option<CompletionSink>,
    observed: Option<Arc<EventQueue>>,
    openable: HashSet<PathBuf>,
    next_handle: u64,
    open: HashMap<DirHandle, PathBuf>,
    pending: HashMap<DirHandle, ReadOp>,
    closed: Vec<DirHandle>,
    fail_reads: bool,
    /// Address of each lent buffer, in read order
    buffer_ids: Vec<usize>,
    /// Observed queue length at each read
    queue_lens: Vec<usize>,
}

impl ScriptedSource {
    pub(crate) fn bind_sink(&self, sink: CompletionSink) {
        self.state.lock().sink = Some(sink);
    }

    /// Record the queue length each time a read is issued
    pub(crate) fn observe(&self, queue: Arc<EventQueue>) {
        self.state.lock().observed = Some(queue);
    }

    /// Make `path` openable
    pub(crate) fn allow(&self, path: impl AsRef<Path>) {
        self.state.lock().openable.insert(path.as_ref().to_path_buf());
    }

    pub(crate) fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub(crate) fn open_path(&self, path: &str) -> io::Result<DirHandle> {
        self.open(Path::new(path))
    }

    pub(crate) fn handle_for(&self, path: impl AsRef<Path>) -> Option<DirHandle> {
        let state = self.state.lock();
        state
            .open
            .iter()
            .find(|(_, p)| p.as_path() == path.as_ref())
            .map(|(h, _)| *h)
    }

    /// Every open handle for `path`
    pub(crate) fn handles_for(&self, path: impl AsRef<Path>) -> Vec<DirHandle> {
        let state = self.state.lock();
        state
            .open
            .iter()
            .filter(|(_, p)| p.as_path() == path.as_ref())
            .map(|(h, _)| *h)
            .collect()
    }

    pub(crate) fn has_pending(&self, handle: DirHandle) -> bool {
        self.state.lock().pending.contains_key(&handle)
    }

    pub(crate) fn is_closed(&self, handle: DirHandle) -> bool {
        self.state.lock().closed.contains(&handle)
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.state.lock().open.len()
    }

    pub(crate) fn reads_issued(&self) -> usize {
        self.state.lock().buffer_ids.len()
    }

    pub(crate) fn buffer_ids(&self) -> Vec<usize> {
        self.state.lock().buffer_ids.clone()
    }

    pub(crate) fn queue_len_at_reads(&self) -> Vec<usize> {
        self.state.lock().queue_lens.clone()
    }

    /// Complete the pending read on `handle` with `entries`.
    pub(crate) fn fill(&self, handle: DirHandle, entries: &[EntryBuilder]) -> Completion {
        let mut op = self.take_pending(handle);
        let bytes = raw::encode(entries, &mut op.buffer).expect("entries fit the buffer");
        Completion {
            token: op.token,
            status: CompletionStatus::Success,
            bytes,
            buffer: op.buffer,
        }
    }

    /// Complete the pending read on `handle` as an overflow.
    pub(crate) fn overflow(&self, handle: DirHandle) -> Completion {
        let op = self.take_pending(handle);
        Completion {
            token: op.token,
            status: CompletionStatus::Success,
            bytes: 0,
            buffer: op.buffer,
        }
    }

    /// Complete the pending read on `handle` with an OS error.
    pub(crate) fn fail(&self, handle: DirHandle, code: i32) -> Completion {
        let op = self.take_pending(handle);
        Completion {
            token: op.token,
            status: CompletionStatus::Failed(code),
            bytes: 0,
            buffer: op.buffer,
        }
    }

    /// Send a completion through the bound sink, as an OS callback would.
    pub(crate) fn deliver(&self, completion: Completion) {
        let sink = self.state.lock().sink.clone().expect("sink bound");
        sink.complete(completion);
    }

    fn take_pending(&self, handle: DirHandle) -> ReadOp {
        self.state
            .lock()
            .pending
            .remove(&handle)
            .expect("read pending on handle")
    }
}

impl NotifySource for ScriptedSource {
    fn bind(&self, sink: CompletionSink) {
        self.bind_sink(sink);
    }

    fn open(&self, path: &Path) -> io::Result<DirHandle> {
        let mut state = self.state.lock();
        if !state.openable.contains(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
        }
        state.next_handle += 1;
        let handle = DirHandle::from_raw(state.next_handle);
        state.open.insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn read(&self, op: ReadOp) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::Other, "read rejected"));
        }
        assert!(
            !state.pending.contains_key(&op.handle),
            "second read issued while one is outstanding"
        );
        let observed_len = state.observed.as_ref().map(|q| q.len());
        if let Some(len) = observed_len {
            state.queue_lens.push(len);
        }
        state.buffer_ids.push(op.buffer.as_ptr() as usize);
        state.pending.insert(op.handle, op);
        Ok(())
    }

    fn cancel(&self, handle: DirHandle) {
        let mut state = self.state.lock();
        if let Some(op) = state.pending.remove(&handle) {
            if let Some(sink) = &state.sink {
                sink.complete(Completion::aborted(op));
            }
        }
    }

    fn close(&self, handle: DirHandle) {
        let mut state = self.state.lock();
        state.open.remove(&handle);
        state.closed.push(handle);
    }
}
