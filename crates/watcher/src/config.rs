//! Watcher configuration
//!
//! Every key is optional in TOML; missing keys take the defaults below.
//!
//! ```toml
//! queue_initial_capacity = 16
//! queue_grow_rate = 2
//! buffer_size = 32768
//! recursive = true
//! thread_name = "dirwatch-notify"
//! ```

use crate::error::WatchError;
use crate::queue::{DEFAULT_GROW_RATE, DEFAULT_INITIAL_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default bytes per ping-pong buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32768;

/// Largest accepted per-buffer size (16 MiB)
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Event queue slots allocated at initialization
    #[serde(default = "default_initial_capacity")]
    pub queue_initial_capacity: usize,

    /// Capacity multiplier when the event queue is full
    #[serde(default = "default_grow_rate")]
    pub queue_grow_rate: usize,

    /// Default bytes per change buffer for new directories
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Whether new directories include subdirectories by default
    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Name of the notification thread
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

impl WatcherConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, WatchError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self, WatchError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.queue_initial_capacity == 0 {
            return Err(WatchError::Config(
                "queue_initial_capacity must be at least 1".to_string(),
            ));
        }
        if self.queue_grow_rate < 2 {
            return Err(WatchError::Config(
                "queue_grow_rate must be at least 2".to_string(),
            ));
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(WatchError::Config(format!(
                "buffer_size must be in 1..={}",
                MAX_BUFFER_SIZE
            )));
        }
        if self.thread_name.is_empty() {
            return Err(WatchError::Config("thread_name must not be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            queue_initial_capacity: default_initial_capacity(),
            queue_grow_rate: default_grow_rate(),
            buffer_size: default_buffer_size(),
            recursive: true,
            thread_name: default_thread_name(),
        }
    }
}

fn default_initial_capacity() -> usize {
    DEFAULT_INITIAL_CAPACITY
}

fn default_grow_rate() -> usize {
    DEFAULT_GROW_RATE
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_true() -> bool {
    true
}

fn default_thread_name() -> String {
    "dirwatch-notify".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = WatcherConfig::from_toml_str("").unwrap();
        assert_eq!(config, WatcherConfig::default());
        assert_eq!(config.buffer_size, 32768);
        assert_eq!(config.queue_initial_capacity, 16);
        assert!(config.recursive);
    }

    #[test]
    fn test_partial_document() {
        let config = WatcherConfig::from_toml_str("buffer_size = 4096\nrecursive = false\n").unwrap();
        assert_eq!(config.buffer_size, 4096);
        assert!(!config.recursive);
        assert_eq!(config.queue_grow_rate, 2);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(matches!(
            WatcherConfig::from_toml_str("queue_grow_rate = 1"),
            Err(WatchError::Config(_))
        ));
        assert!(matches!(
            WatcherConfig::from_toml_str("buffer_size = 0"),
            Err(WatchError::Config(_))
        ));
        assert!(matches!(
            WatcherConfig::from_toml_str("queue_initial_capacity = 0"),
            Err(WatchError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(matches!(
            WatcherConfig::from_toml_str("buffer_size = \"big\""),
            Err(WatchError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dirwatch.toml");
        std::fs::write(&path, "thread_name = \"assets\"\n").unwrap();

        let config = WatcherConfig::load(&path).unwrap();
        assert_eq!(config.thread_name, "assets");

        let missing = WatcherConfig::load(&temp_dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(WatchError::Io(_))));
    }
}
