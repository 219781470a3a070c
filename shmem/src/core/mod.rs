use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{QueueError, Result};

/// Offset 0 holds the mutex, so no node ever lives there.
pub const NIL: u64 = 0;

pub const DEFAULT_POOL_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_WAIT_SLICE_MS: u64 = 100;

/// Bytes reserved for each process-shared primitive at the front of the segment.
pub(crate) const LOCK_REGION_SIZE: usize = 256;
pub(crate) const MUTEX_OFFSET: usize = 0;
pub(crate) const EVENT_OFFSET: usize = MUTEX_OFFSET + LOCK_REGION_SIZE;
pub(crate) const HEADER_OFFSET: usize = EVENT_OFFSET + LOCK_REGION_SIZE;
pub(crate) const HEAP_OFFSET: usize = align_up(HEADER_OFFSET + mem::size_of::<QueueHeader>(), ALIGN);

pub(crate) const ALIGN: usize = 16;

pub(crate) const QUEUE_MAGIC: u64 = 0x5348_4d51_5545_5545; // "SHMQUEUE"
pub(crate) const LAYOUT_VERSION: u64 = 1;

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Free-list bookkeeping of the node heap. All values are offsets from the pool base.
#[repr(C)]
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct HeapState {
    pub start: u64,
    // Everything in [top, end) has never been handed out, or was returned to the tail.
    pub top: u64,
    pub end: u64,
    pub free_head: u64,
}

#[repr(C)]
pub(crate) struct QueueHeader {
    /// Written last by the creator; attachers wait for it.
    pub magic: AtomicU64,
    pub version: u64,
    pub pool_size: u64,
    pub heap: HeapState,
    pub head: u64,
    pub tail: u64,
    pub count: u64,
    pub live_bytes: u64,
    pub closed: u64,
    pub total_puts: u64,
    pub total_gets: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Name of the OS shared-memory object. There is no implicit default.
    pub name: String,
    pub size: usize,
    /// Upper bound on waiting for the shared mutex. 0 waits forever.
    pub lock_timeout_ms: u64,
    /// How long a blocked `get` sleeps on the event before re-checking the header.
    pub wait_slice_ms: u64,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            name: String::new(),
            size: DEFAULT_POOL_SIZE,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            wait_slice_ms: DEFAULT_WAIT_SLICE_MS,
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder::default()
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim_start_matches('/').is_empty() {
            return Err(QueueError::Config("pool name must not be empty".to_string()));
        }
        if self.name.trim_start_matches('/').contains('/') {
            return Err(QueueError::Config(format!(
                "pool name {:?} must not contain '/' after the leading one",
                self.name
            )));
        }
        if self.size < min_pool_size() {
            return Err(QueueError::Config(format!(
                "pool size {} is below the minimum of {} bytes",
                self.size,
                min_pool_size()
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ShmemConfigBuilder {
    cfg: ShmemConfig,
}

impl ShmemConfigBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.cfg.name = name.into();
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.cfg.size = size;
        self
    }

    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cfg.lock_timeout_ms = timeout.map_or(0, |t| t.as_millis().max(1) as u64);
        self
    }

    pub fn wait_slice(mut self, slice: Duration) -> Self {
        self.cfg.wait_slice_ms = slice.as_millis().max(1) as u64;
        self
    }

    pub fn build(self) -> Result<ShmemConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// The smallest pool that can hold the header and a single empty item.
pub fn min_pool_size() -> usize {
    HEAP_OFFSET + crate::alloc::MIN_BLOCK_SIZE
}

/// POSIX shared-memory names carry exactly one leading slash.
pub fn os_name(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

/// A process-local view of one named shared-memory segment.
///
/// Dropping the pool only unmaps it. The name is removed from the system
/// namespace by [`SharedMemoryPool::destroy`] alone, and nothing counts how
/// many processes still have it mapped.
pub struct SharedMemoryPool {
    shmem: Shmem,
    name: String,
    size: usize,
}

impl SharedMemoryPool {
    /// Creates the segment, maps it and zeroes everything in front of the node heap.
    pub fn create(name: &str, size: usize) -> Result<SharedMemoryPool> {
        let name = os_name(name);
        if size < min_pool_size() {
            return Err(QueueError::Allocation {
                name,
                reason: format!("size {} is below the minimum of {} bytes", size, min_pool_size()),
            });
        }
        let mut shmem = ShmemConf::new()
            .os_id(&name)
            .size(size)
            .create()
            .map_err(|e| allocation_error(&name, e))?;
        if shmem.len() < size {
            // Still the owner here, so dropping the mapping unlinks the name.
            return Err(QueueError::Allocation {
                name,
                reason: format!("mapped {} bytes, wanted {}", shmem.len(), size),
            });
        }
        // Destroy is explicit; an exiting creator must not take the name with it.
        shmem.set_owner(false);
        unsafe { ptr::write_bytes(shmem.as_ptr(), 0, HEAP_OFFSET) };
        info!(pool = %name, size, "created shared memory pool");
        Ok(SharedMemoryPool { shmem, name, size })
    }

    /// Maps an existing segment without touching its contents.
    pub fn attach(name: &str) -> Result<SharedMemoryPool> {
        let name = os_name(name);
        let mut shmem = match ShmemConf::new().os_id(&name).open() {
            Ok(v) => v,
            Err(ShmemError::MapOpenFailed(code))
                if io::Error::from_raw_os_error(code as i32).kind() == io::ErrorKind::NotFound =>
            {
                return Err(QueueError::NotFound(name));
            }
            Err(e) => {
                return Err(QueueError::Allocation { name, reason: e.to_string() });
            }
        };
        shmem.set_owner(false);
        let size = shmem.len();
        debug!(pool = %name, size, base = ?shmem.as_ptr(), "attached shared memory pool");
        Ok(SharedMemoryPool { shmem, name, size })
    }

    /// Unlinks the name and unmaps this view. Processes that still have the
    /// segment mapped keep their view; new attaches fail with `NotFound`.
    pub fn destroy(mut self) {
        info!(pool = %self.name, "destroying shared memory pool");
        self.shmem.set_owner(true);
    }

    /// Unmaps this view and leaves the segment in place.
    pub fn detach(self) {
        debug!(pool = %self.name, "detaching shared memory pool");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Process-local base address. Never store it in the segment.
    pub fn base(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    /// Converts an offset into a local pointer, checking that `len` bytes fit.
    pub fn at(&self, offset: u64, len: usize) -> Result<*mut u8> {
        let offset = offset as usize;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(unsafe { self.base().add(offset) }),
            _ => Err(QueueError::corruption(format!(
                "range {}+{} is outside the {} byte pool",
                offset, len, self.size
            ))),
        }
    }
}

fn allocation_error(name: &str, err: ShmemError) -> QueueError {
    let reason = match err {
        ShmemError::MappingIdExists => "a pool with this name already exists".to_string(),
        e => e.to_string(),
    };
    QueueError::Allocation { name: name.to_string(), reason }
}
