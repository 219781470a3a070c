//! C ABI over [`shmqueue::SharedQueue`] for host-language bindings.
//!
//! Handles are opaque pointers created by `shmq_create_queue`,
//! `shmq_attach_queue` or `shmq_open_config` and consumed by exactly one of
//! `shmq_detach_queue` / `shmq_destroy_queue`. Items returned by
//! `shmq_dequeue` are owned by the caller until passed to `shmq_item_free`.
//! No panic crosses the boundary.

use std::ffi::CStr;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use std::time::Duration;

use libc::{c_char, c_int, c_longlong, size_t};
use tracing::{error, warn};

use shmqueue::{QueueError, SharedQueue, ShmemConfig};

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShmqStatus {
    Ok = 0,
    /// The queue is closed and drained.
    Empty = 1,
    AllocationError = -1,
    NotFound = -2,
    OutOfSpace = -3,
    QueueClosed = -4,
    Corruption = -5,
    Timeout = -6,
    InvalidArgument = -7,
    Internal = -8,
}

impl From<&QueueError> for ShmqStatus {
    fn from(err: &QueueError) -> Self {
        match err {
            QueueError::Allocation { .. } => ShmqStatus::AllocationError,
            QueueError::NotFound(_) => ShmqStatus::NotFound,
            QueueError::OutOfSpace { .. } => ShmqStatus::OutOfSpace,
            QueueError::QueueClosed => ShmqStatus::QueueClosed,
            QueueError::Corruption(_) => ShmqStatus::Corruption,
            QueueError::Timeout(_) => ShmqStatus::Timeout,
            QueueError::Config(_) => ShmqStatus::InvalidArgument,
            QueueError::Lock(_) | QueueError::PoisonedLock | QueueError::Io(_) => ShmqStatus::Internal,
        }
    }
}

/// A dequeued item. `data` is null and `len` is 0 when nothing was returned.
#[repr(C)]
#[derive(Debug)]
pub struct ShmqItem {
    pub data: *mut u8,
    pub len: size_t,
}

pub struct ShmqHandle {
    queue: SharedQueue,
}

fn status_of(err: QueueError) -> ShmqStatus {
    let status = ShmqStatus::from(&err);
    match status {
        ShmqStatus::Corruption | ShmqStatus::Internal => error!(error = %err, "shared queue call failed"),
        _ => warn!(error = %err, "shared queue call failed"),
    }
    status
}

fn guarded<F>(f: F) -> ShmqStatus
where
    F: FnOnce() -> Result<ShmqStatus, QueueError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => status_of(e),
        Err(_) => {
            error!("panic caught at the C boundary");
            ShmqStatus::Internal
        }
    }
}

unsafe fn str_arg<'a>(s: *const c_char) -> Result<&'a str, QueueError> {
    if s.is_null() {
        return Err(QueueError::Config("null string argument".to_string()));
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|e| QueueError::Config(format!("argument is not UTF-8: {}", e)))
}

unsafe fn handle_arg<'a>(handle: *mut ShmqHandle) -> Result<&'a ShmqHandle, QueueError> {
    handle
        .as_ref()
        .ok_or_else(|| QueueError::Config("null queue handle".to_string()))
}

unsafe fn publish(out: *mut *mut ShmqHandle, queue: SharedQueue) -> Result<ShmqStatus, QueueError> {
    *out = Box::into_raw(Box::new(ShmqHandle { queue }));
    Ok(ShmqStatus::Ok)
}

fn name_config(name: &str, size: usize) -> Result<ShmemConfig, QueueError> {
    let mut cfg = ShmemConfig { name: name.to_string(), ..Default::default() };
    if size > 0 {
        cfg.size = size;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Creates a queue named `name` in a new pool of `size` bytes (0 picks the default size).
///
/// # Safety
/// `name` must be a NUL-terminated string and `out` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn shmq_create_queue(name: *const c_char, size: size_t, out: *mut *mut ShmqHandle) -> ShmqStatus {
    guarded(|| {
        if out.is_null() {
            return Err(QueueError::Config("null out pointer".to_string()));
        }
        let cfg = name_config(str_arg(name)?, size)?;
        publish(out, SharedQueue::create(&cfg)?)
    })
}

/// # Safety
/// `name` must be a NUL-terminated string and `out` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn shmq_attach_queue(name: *const c_char, out: *mut *mut ShmqHandle) -> ShmqStatus {
    guarded(|| {
        if out.is_null() {
            return Err(QueueError::Config("null out pointer".to_string()));
        }
        let cfg = name_config(str_arg(name)?, 0)?;
        publish(out, SharedQueue::attach(&cfg)?)
    })
}

/// Loads a TOML config file and creates (`create != 0`) or attaches to the queue it names.
///
/// # Safety
/// `config_path` must be a NUL-terminated string and `out` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn shmq_open_config(config_path: *const c_char, create: c_int, out: *mut *mut ShmqHandle) -> ShmqStatus {
    guarded(|| {
        if out.is_null() {
            return Err(QueueError::Config("null out pointer".to_string()));
        }
        let path = str_arg(config_path)?;
        let cfg: ShmemConfig = confy::load_path(path).map_err(|e| QueueError::Config(e.to_string()))?;
        let queue = if create != 0 { SharedQueue::create(&cfg)? } else { SharedQueue::attach(&cfg)? };
        publish(out, queue)
    })
}

/// Unmaps the handle's view and frees the handle.
///
/// # Safety
/// `handle` must come from this library and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn shmq_detach_queue(handle: *mut ShmqHandle) -> ShmqStatus {
    guarded(|| {
        handle_arg(handle)?;
        Box::from_raw(handle).queue.detach();
        Ok(ShmqStatus::Ok)
    })
}

/// Unlinks the pool, unmaps the handle's view and frees the handle.
///
/// # Safety
/// `handle` must come from this library and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn shmq_destroy_queue(handle: *mut ShmqHandle) -> ShmqStatus {
    guarded(|| {
        handle_arg(handle)?;
        Box::from_raw(handle).queue.destroy();
        Ok(ShmqStatus::Ok)
    })
}

/// # Safety
/// `handle` must be live; `data` must point at `len` readable bytes (or be null with `len == 0`).
#[no_mangle]
pub unsafe extern "C" fn shmq_enqueue(handle: *mut ShmqHandle, data: *const u8, len: size_t) -> ShmqStatus {
    guarded(|| {
        let handle = handle_arg(handle)?;
        let item = if len == 0 {
            &[][..]
        } else if data.is_null() {
            return Err(QueueError::Config("null data with non-zero length".to_string()));
        } else {
            slice::from_raw_parts(data, len)
        };
        handle.queue.put(item)?;
        Ok(ShmqStatus::Ok)
    })
}

/// Takes the head item into `out`. A negative `timeout_ms` blocks until an
/// item arrives or the queue closes. Returns `Empty` once closed and drained.
///
/// # Safety
/// `handle` must be live and `out` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn shmq_dequeue(handle: *mut ShmqHandle, timeout_ms: c_longlong, out: *mut ShmqItem) -> ShmqStatus {
    guarded(|| {
        let handle = handle_arg(handle)?;
        let out = out
            .as_mut()
            .ok_or_else(|| QueueError::Config("null out pointer".to_string()))?;
        *out = ShmqItem { data: ptr::null_mut(), len: 0 };
        let item = if timeout_ms < 0 {
            handle.queue.get()?
        } else {
            handle.queue.get_timeout(Duration::from_millis(timeout_ms as u64))?
        };
        match item {
            Some(item) => {
                let boxed = item.into_boxed_slice();
                let len = boxed.len();
                *out = ShmqItem { data: Box::into_raw(boxed) as *mut u8, len };
                Ok(ShmqStatus::Ok)
            }
            None => Ok(ShmqStatus::Empty),
        }
    })
}

/// Releases an item filled in by `shmq_dequeue`.
///
/// # Safety
/// `item` must have been filled by `shmq_dequeue` and not freed before.
#[no_mangle]
pub unsafe extern "C" fn shmq_item_free(item: *mut ShmqItem) {
    if let Some(item) = item.as_mut() {
        if !item.data.is_null() {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(item.data, item.len)));
        }
        item.data = ptr::null_mut();
        item.len = 0;
    }
}

/// Number of queued items, or a negative `ShmqStatus` on failure.
///
/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn shmq_qsize(handle: *mut ShmqHandle) -> c_longlong {
    let mut size = 0;
    let status = guarded(|| {
        size = handle_arg(handle)?.queue.qsize()? as c_longlong;
        Ok(ShmqStatus::Ok)
    });
    match status {
        ShmqStatus::Ok => size,
        failed => failed as c_longlong,
    }
}

/// 1 if empty, 0 if not, a negative `ShmqStatus` on failure.
///
/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn shmq_empty(handle: *mut ShmqHandle) -> c_int {
    let mut empty = false;
    let status = guarded(|| {
        empty = handle_arg(handle)?.queue.empty()?;
        Ok(ShmqStatus::Ok)
    });
    match status {
        ShmqStatus::Ok => empty as c_int,
        failed => failed as c_int,
    }
}

/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn shmq_close(handle: *mut ShmqHandle) -> ShmqStatus {
    guarded(|| {
        handle_arg(handle)?.queue.close()?;
        Ok(ShmqStatus::Ok)
    })
}
