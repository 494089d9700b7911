//! Watcher lifecycle and registration
//!
//! The [`Watcher`] owns the notification thread. Registration opens the
//! directory on the calling thread and hands the request over the channel;
//! the engine issues the first read. Changes are pulled with
//! [`Watcher::try_next_change`] from any thread.

use crate::config::{WatcherConfig, MAX_BUFFER_SIZE};
use crate::engine::{Engine, Message, Shared};
use crate::error::WatchError;
use crate::queue::EventQueue;
use crate::record::ChangeRecord;
use crate::request::{encode_wide, ReadRequest};
use crate::source::{CompletionSink, NotifySource, PlatformSource, WatchId};
use crate::Result;
use crossbeam_channel::{unbounded, Sender};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Per-directory registration options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Include subdirectories
    pub recursive: bool,
    /// Bytes per change buffer; each directory holds two
    pub buffer_size: usize,
}

impl WatchOptions {
    pub fn from_config(config: &WatcherConfig) -> Self {
        Self {
            recursive: config.recursive,
            buffer_size: config.buffer_size,
        }
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from_config(&WatcherConfig::default())
    }
}

/// Asynchronous directory change watcher.
///
/// Dropping the watcher shuts it down the same way [`Watcher::shutdown`]
/// does.
pub struct Watcher {
    config: WatcherConfig,
    source: Arc<dyn NotifySource>,
    queue: Arc<EventQueue>,
    shared: Arc<Shared>,
    tx: Sender<Message>,
    thread: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl Watcher {
    /// Start a watcher on this platform's native notification source.
    pub fn initialize(config: WatcherConfig) -> Result<Self> {
        let source = PlatformSource::new()?;
        Self::with_source(config, Arc::new(source))
    }

    /// Start a watcher on a caller-supplied notification source.
    pub fn with_source(config: WatcherConfig, source: Arc<dyn NotifySource>) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(EventQueue::new(
            config.queue_initial_capacity,
            config.queue_grow_rate,
        ));
        let shared = Arc::new(Shared::default());
        let (tx, rx) = unbounded();
        source.bind(CompletionSink::new(tx.clone()));

        let engine = Engine::new(Arc::clone(&source), Arc::clone(&queue), Arc::clone(&shared));
        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || engine.run(rx))
            .map_err(WatchError::Spawn)?;

        info!(
            "Watcher initialized (queue capacity {}, buffer size {})",
            config.queue_initial_capacity, config.buffer_size
        );

        Ok(Self {
            config,
            source,
            queue,
            shared,
            tx,
            thread: Some(thread),
            next_id: AtomicU64::new(1),
        })
    }

    /// Watch `path` with the configured defaults.
    pub fn add_directory(&self, path: impl AsRef<Path>) -> Result<WatchId> {
        self.add_directory_with(path, WatchOptions::from_config(&self.config))
    }

    /// Watch `path` with explicit options.
    ///
    /// On error nothing is registered and no handle is left open.
    pub fn add_directory_with(&self, path: impl AsRef<Path>, options: WatchOptions) -> Result<WatchId> {
        let path = path.as_ref();
        if options.buffer_size == 0 || options.buffer_size > MAX_BUFFER_SIZE {
            return Err(WatchError::InvalidBufferSize);
        }
        let directory = encode_wide(path)?;

        let handle = self.source.open(path).map_err(|source| WatchError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = ReadRequest::new(
            id,
            handle,
            path,
            directory,
            options.recursive,
            options.buffer_size,
        );

        // Counted before sending so the engine cannot finish with it queued
        self.shared.acquire();
        if self.tx.send(Message::Watch(request)).is_err() {
            self.shared.release();
            self.source.close(handle);
            return Err(WatchError::Disconnected);
        }

        debug!("Registered {} as {}", path.display(), id);
        Ok(id)
    }

    /// Take the oldest change, if one is ready.
    ///
    /// A rename's old name is held back until its new name has been queued.
    pub fn try_next_change(&self) -> Option<ChangeRecord> {
        self.queue.pop()
    }

    /// Drain every change that is ready right now.
    pub fn changes(&self) -> impl Iterator<Item = ChangeRecord> + '_ {
        std::iter::from_fn(move || self.queue.pop())
    }

    /// Directories registered and not yet torn down
    pub fn outstanding_requests(&self) -> usize {
        self.shared.outstanding()
    }

    /// Changes waiting to be taken
    pub fn queued_changes(&self) -> usize {
        self.queue.len()
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Cancel every read, wait for the notification thread to release all
    /// requests, and join it. Undelivered changes are discarded.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        info!(
            "Shutting down watcher with {} outstanding requests",
            self.shared.outstanding()
        );
        self.shared.begin_terminate();
        // The engine may already have exited if nothing was outstanding
        let _ = self.tx.send(Message::Shutdown);

        if thread.join().is_err() {
            error!("Notification thread panicked");
        }
        info!("Watcher shut down");
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}
