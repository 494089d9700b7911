//! Error type for watcher operations

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    /// The directory could not be opened; nothing was registered
    #[error("failed to open {} for watching: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("path {} cannot be converted to the native path encoding", .0.display())]
    InvalidPath(PathBuf),

    #[error("change buffer size must be in 1..=16 MiB")]
    InvalidBufferSize,

    #[error("failed to start notification thread: {0}")]
    Spawn(#[source] io::Error),

    /// The notification thread is gone, so registrations cannot be delivered
    #[error("notification thread is not running")]
    Disconnected,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
