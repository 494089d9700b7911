//! Asynchronous directory change notifications
//!
//! This crate provides:
//! - Recursive or flat watching of any number of directories
//! - A dedicated notification thread with ping-pong change buffers
//! - A growable, thread-safe FIFO of change records
//! - Rename pairing (old name is held back until the new name is queued)
//! - Overflow reporting as a single `TooManyChanges` record per directory

mod engine;
mod request;

pub mod config;
pub mod error;
pub mod queue;
pub mod raw;
pub mod record;
pub mod source;
pub mod watcher;

// Re-exports
pub use config::WatcherConfig;
pub use engine::decode_batch;
pub use error::WatchError;
pub use queue::EventQueue;
pub use record::{ChangeRecord, FileAction};
pub use source::{NotifySource, WatchId};
pub use watcher::{WatchOptions, Watcher};

/// Result type for watcher operations
pub type Result<T> = std::result::Result<T, WatchError>;
