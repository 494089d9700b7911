//! dirwatch - print filesystem changes under one or more directories

use anyhow::{Context, Result};
use clap::Parser;
use dirwatch::{FileAction, Watcher, WatcherConfig};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod filter;
mod output;
mod rescan;

use filter::FilterSet;
use output::Printer;
use rescan::Rescanner;

/// Watch directories and print every change as it is reported
#[derive(Parser)]
#[command(name = "dirwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directories to watch
    #[arg(required = true)]
    directories: Vec<PathBuf>,

    /// Only watch the top level of each directory
    #[arg(long)]
    non_recursive: bool,

    /// Bytes per change buffer (default: 32768, or the config file's value)
    #[arg(long)]
    buffer_size: Option<usize>,

    /// TOML file with watcher settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Milliseconds between polls of the change queue
    #[arg(long, default_value = "100")]
    poll_ms: u64,

    /// Print one JSON object per change
    #[arg(long)]
    json: bool,

    /// Hide changes matching a gitignore-style pattern (repeatable)
    #[arg(long = "ignore", value_name = "GLOB")]
    ignore: Vec<String>,

    /// Also show editor swap/backup files and OS metadata files
    #[arg(long)]
    no_default_ignores: bool,

    /// After an overflow, list files modified since the previous poll
    #[arg(long)]
    rescan_on_overflow: bool,

    /// Stop after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn main() -> Result<()> {
    // Diagnostics go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    // 1. Resolve configuration
    let mut config = match &cli.config {
        Some(path) => WatcherConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WatcherConfig::default(),
    };
    if cli.non_recursive {
        config.recursive = false;
    }
    if let Some(size) = cli.buffer_size {
        config.buffer_size = size;
    }

    // 2. Start the watcher and register every directory
    let watcher = Watcher::initialize(config).context("Failed to start watcher")?;
    for directory in &cli.directories {
        let id = watcher
            .add_directory(directory)
            .with_context(|| format!("Failed to watch {}", directory.display()))?;
        info!("Watching {} ({})", directory.display(), id);
    }

    let filter = FilterSet::new(&cli.directories, &cli.ignore, !cli.no_default_ignores)?;
    let printer = Printer::new(cli.json);
    let mut rescanner = cli.rescan_on_overflow.then(Rescanner::new);

    // 3. Poll until the deadline (or forever)
    let poll_interval = Duration::from_millis(cli.poll_ms.max(1));
    let deadline = cli.duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));

    loop {
        let poll_started = SystemTime::now();

        for record in watcher.changes() {
            if record.action == FileAction::TooManyChanges {
                printer.overflow(&record)?;
                if let Some(rescanner) = &rescanner {
                    for path in rescanner.scan(Path::new(&record.path), &filter)? {
                        printer.rescanned(&path)?;
                    }
                }
                continue;
            }

            if !filter.is_ignored(&record) {
                printer.change(&record)?;
            }
        }

        if let Some(rescanner) = &mut rescanner {
            rescanner.advance(poll_started);
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        thread::sleep(poll_interval);
    }

    // 4. Cancel outstanding reads and join the notification thread
    watcher.shutdown();
    Ok(())
}
