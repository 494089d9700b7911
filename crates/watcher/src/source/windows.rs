//! `ReadDirectoryChangesExW` notification source
//!
//! Directory handles are opened for overlapped I/O and associated with one
//! I/O completion port. A pump thread waits on the port and forwards each
//! finished read to the completion sink; all other work happens on the
//! notification thread.
//!
//! Buffers are written with `FILE_NOTIFY_EXTENDED_INFORMATION` entries, the
//! layout [`crate::raw`] decodes.

use super::{Completion, CompletionSink, CompletionStatus, DirHandle, NotifySource, ReadOp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_NOTIFY_ENUM_DIR, ERROR_OPERATION_ABORTED, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesExW, ReadDirectoryNotifyExtendedInformation,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
    OVERLAPPED,
};

const INFINITE: u32 = u32::MAX;

/// Completion key for directory reads
const READ_KEY: usize = 0;
/// Completion key that stops the pump
const SHUTDOWN_KEY: usize = 1;

#[derive(Debug, Clone, Copy)]
struct RawHandle(HANDLE);

// Kernel handles may be used from any thread
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

/// A read the kernel is currently filling
struct InFlight {
    /// Must stay at a fixed address until the completion is dequeued
    _overlapped: Box<OVERLAPPED>,
    op: ReadOp,
}

// The OVERLAPPED is only touched by the kernel and the pump thread
unsafe impl Send for InFlight {}

struct PortShared {
    port: RawHandle,
    handles: Mutex<HashMap<DirHandle, RawHandle>>,
    /// Keyed by OVERLAPPED address
    in_flight: Mutex<HashMap<usize, InFlight>>,
    sink: Mutex<Option<CompletionSink>>,
}

/// [`NotifySource`] on `ReadDirectoryChangesExW` and an I/O completion port
pub struct DirectoryChangesSource {
    shared: Arc<PortShared>,
    pump: Option<JoinHandle<()>>,
    next_handle: AtomicU64,
}

impl DirectoryChangesSource {
    pub fn new() -> io::Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }

        let shared = Arc::new(PortShared {
            port: RawHandle(port),
            handles: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
        });

        let pump_shared = Arc::clone(&shared);
        let pump = thread::Builder::new()
            .name("dirwatch-iocp".to_string())
            .spawn(move || run_pump(&pump_shared))?;

        Ok(Self {
            shared,
            pump: Some(pump),
            next_handle: AtomicU64::new(1),
        })
    }

    fn directory(&self, handle: DirHandle) -> io::Result<RawHandle> {
        self.shared
            .handles
            .lock()
            .get(&handle)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown directory handle"))
    }
}

impl NotifySource for DirectoryChangesSource {
    fn bind(&self, sink: CompletionSink) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn open(&self, path: &Path) -> io::Result<DirHandle> {
        if !std::fs::metadata(path)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a directory", path.display()),
            ));
        }

        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        let directory = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if directory == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }

        let port = unsafe { CreateIoCompletionPort(directory, self.shared.port.0, READ_KEY, 0) };
        if port.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(directory) };
            return Err(e);
        }

        let handle = DirHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.shared.handles.lock().insert(handle, RawHandle(directory));
        debug!("Opened {} as {:?}", path.display(), handle);
        Ok(handle)
    }

    fn read(&self, mut op: ReadOp) -> io::Result<()> {
        let directory = self.directory(op.handle)?;
        let length = u32::try_from(op.buffer.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer too large"))?;
        let buffer = op.buffer.as_mut_ptr().cast::<c_void>();
        let recursive = i32::from(op.recursive);
        let filter = op.filter.bits();

        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { mem::zeroed() });
        let overlapped_ptr: *mut OVERLAPPED = &mut *overlapped;
        let key = overlapped_ptr as usize;

        // Registered first so a fast completion finds its entry
        self.shared.in_flight.lock().insert(
            key,
            InFlight {
                _overlapped: overlapped,
                op,
            },
        );

        let ok = unsafe {
            ReadDirectoryChangesExW(
                directory.0,
                buffer,
                length,
                recursive,
                filter,
                ptr::null_mut(),
                overlapped_ptr,
                None,
                ReadDirectoryNotifyExtendedInformation,
            )
        };
        if ok == 0 {
            let e = io::Error::last_os_error();
            // No packet is queued for a call that failed outright
            self.shared.in_flight.lock().remove(&key);
            return Err(e);
        }
        Ok(())
    }

    fn cancel(&self, handle: DirHandle) {
        let Ok(directory) = self.directory(handle) else {
            return;
        };
        // Fails with ERROR_NOT_FOUND when the read already completed
        unsafe { CancelIoEx(directory.0, ptr::null()) };
    }

    fn close(&self, handle: DirHandle) {
        if let Some(directory) = self.shared.handles.lock().remove(&handle) {
            unsafe { CloseHandle(directory.0) };
        }
    }
}

impl Drop for DirectoryChangesSource {
    fn drop(&mut self) {
        let leftover: Vec<RawHandle> = self.shared.handles.lock().drain().map(|(_, h)| h).collect();
        for directory in leftover {
            unsafe {
                CancelIoEx(directory.0, ptr::null());
                CloseHandle(directory.0);
            }
        }

        let ok = unsafe { PostQueuedCompletionStatus(self.shared.port.0, 0, SHUTDOWN_KEY, ptr::null()) };
        if ok != 0 {
            if let Some(pump) = self.pump.take() {
                let _ = pump.join();
            }
        }

        // The kernel may still own these buffers
        let stranded: Vec<InFlight> = self.shared.in_flight.lock().drain().map(|(_, f)| f).collect();
        if !stranded.is_empty() {
            warn!("Leaking {} reads still owned by the kernel", stranded.len());
            mem::forget(stranded);
        }
    }
}

impl Drop for PortShared {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port.0) };
    }
}

fn run_pump(shared: &PortShared) {
    loop {
        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(shared.port.0, &mut bytes, &mut key, &mut overlapped, INFINITE)
        };

        if overlapped.is_null() {
            if key == SHUTDOWN_KEY {
                break;
            }
            if ok == 0 {
                error!("Completion port wait failed: {}", io::Error::last_os_error());
                break;
            }
            continue;
        }

        let status = if ok != 0 {
            CompletionStatus::Success
        } else {
            match unsafe { GetLastError() } {
                ERROR_OPERATION_ABORTED => CompletionStatus::Aborted,
                // The kernel buffer overflowed; same as a zero-byte success
                ERROR_NOTIFY_ENUM_DIR => {
                    bytes = 0;
                    CompletionStatus::Success
                }
                code => CompletionStatus::Failed(code as i32),
            }
        };

        let Some(entry) = shared.in_flight.lock().remove(&(overlapped as usize)) else {
            warn!("Completion for an unknown read");
            continue;
        };

        let completion = Completion {
            token: entry.op.token,
            status,
            bytes: bytes as usize,
            buffer: entry.op.buffer,
        };
        let sink = shared.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.complete(completion);
            }
            None => warn!("Completion for {} dropped: no sink bound", completion.token),
        }
    }
}
