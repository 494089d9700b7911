//! Integration tests against the platform notification source
//!
//! Each test waits for its watcher to report a marker write before making the
//! changes under test, since the first read is issued asynchronously.

use dirwatch::{ChangeRecord, FileAction, WatchError, WatchOptions, Watcher, WatcherConfig};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn start() -> Watcher {
    Watcher::initialize(WatcherConfig::default()).unwrap()
}

/// Write marker files until the watcher reports one, then drain.
fn settle(watcher: &Watcher, dir: &Path) {
    let deadline = Instant::now() + TIMEOUT;
    for attempt in 0.. {
        assert!(Instant::now() < deadline, "watcher never became active");
        fs::write(dir.join(format!(".settle-{}", attempt)), b"settle").unwrap();
        thread::sleep(Duration::from_millis(50));
        if watcher.changes().count() > 0 {
            break;
        }
    }
    thread::sleep(Duration::from_millis(100));
    watcher.changes().for_each(drop);
}

/// Collect records until one satisfies `done`.
fn collect_until(watcher: &Watcher, mut done: impl FnMut(&ChangeRecord) -> bool) -> Vec<ChangeRecord> {
    let deadline = Instant::now() + TIMEOUT;
    let mut seen = Vec::new();
    loop {
        while let Some(record) = watcher.try_next_change() {
            let finished = done(&record);
            seen.push(record);
            if finished {
                return seen;
            }
        }
        assert!(Instant::now() < deadline, "expected change not reported: {:?}", seen);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_created_file_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let watcher = start();
    watcher.add_directory(temp_dir.path()).unwrap();
    settle(&watcher, temp_dir.path());

    fs::write(temp_dir.path().join("new_file.txt"), b"hello").unwrap();

    let records = collect_until(&watcher, |r| {
        r.action == FileAction::Added && r.path.ends_with("new_file.txt")
    });
    let added = records.last().unwrap();
    assert!(!added.is_directory);
    assert!(added.path.starts_with(&*temp_dir.path().to_string_lossy()));

    watcher.shutdown();
}

#[test]
fn test_nested_change_is_reported_recursively() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir(temp_dir.path().join("sub")).unwrap();
    let watcher = start();
    watcher.add_directory(temp_dir.path()).unwrap();
    settle(&watcher, temp_dir.path());

    fs::write(temp_dir.path().join("sub").join("inner.txt"), b"nested").unwrap();

    let records = collect_until(&watcher, |r| r.path.ends_with("inner.txt"));
    assert!(records.last().unwrap().path.contains("sub"));
}

#[test]
fn test_non_recursive_ignores_subdirectories() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir(temp_dir.path().join("sub")).unwrap();
    let watcher = start();
    let options = WatchOptions {
        recursive: false,
        ..WatchOptions::default()
    };
    watcher.add_directory_with(temp_dir.path(), options).unwrap();
    settle(&watcher, temp_dir.path());

    fs::write(temp_dir.path().join("sub").join("inner.txt"), b"hidden").unwrap();
    fs::write(temp_dir.path().join("marker.txt"), b"visible").unwrap();

    let records = collect_until(&watcher, |r| r.path.ends_with("marker.txt"));
    assert!(records.iter().all(|r| !r.path.ends_with("inner.txt")));
}

#[cfg(any(target_os = "linux", windows))]
#[test]
fn test_rename_is_reported_as_pair() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("before.txt"), b"data").unwrap();
    let watcher = start();
    watcher.add_directory(temp_dir.path()).unwrap();
    settle(&watcher, temp_dir.path());

    fs::rename(
        temp_dir.path().join("before.txt"),
        temp_dir.path().join("after.txt"),
    )
    .unwrap();

    let records = collect_until(&watcher, |r| r.action == FileAction::RenamedTo);
    let to = records.last().unwrap();
    assert!(to.path.ends_with("after.txt"));

    let from = &records[records.len() - 2];
    assert_eq!(from.action, FileAction::RenamedFrom);
    assert!(from.path.ends_with("before.txt"));
}

#[cfg(target_os = "linux")]
#[test]
fn test_deleted_root_stops_watching() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("doomed");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("inside.txt"), b"x").unwrap();

    let watcher = start();
    watcher.add_directory(&root).unwrap();
    settle(&watcher, &root);
    assert_eq!(watcher.outstanding_requests(), 1);

    fs::remove_dir_all(&root).unwrap();

    let deadline = Instant::now() + TIMEOUT;
    while watcher.outstanding_requests() > 0 {
        assert!(Instant::now() < deadline, "request outlived its deleted root");
        watcher.changes().for_each(drop);
        thread::sleep(Duration::from_millis(10));
    }

    watcher.shutdown();
}

#[test]
fn test_missing_directory_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let watcher = start();

    let result = watcher.add_directory(temp_dir.path().join("does-not-exist"));
    assert!(matches!(result, Err(WatchError::Open { .. })));
    assert_eq!(watcher.outstanding_requests(), 0);
}

#[test]
fn test_file_path_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("plain.txt");
    fs::write(&file, b"not a directory").unwrap();
    let watcher = start();

    assert!(watcher.add_directory(&file).is_err());
    assert_eq!(watcher.outstanding_requests(), 0);
}

#[test]
fn test_shutdown_with_active_directories() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let watcher = start();
    watcher.add_directory(first.path()).unwrap();
    watcher.add_directory(second.path()).unwrap();
    settle(&watcher, first.path());
    settle(&watcher, second.path());
    assert_eq!(watcher.outstanding_requests(), 2);

    let started = Instant::now();
    watcher.shutdown();
    assert!(started.elapsed() < TIMEOUT);
}

#[test]
fn test_shutdown_without_directories() {
    let watcher = start();
    watcher.shutdown();
}
