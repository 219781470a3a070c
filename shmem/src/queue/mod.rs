use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::locks::LockGuard;
use tracing::{debug, info, warn};

use crate::alloc::{AllocStats, NodeAllocator};
use crate::core::*;
use crate::errors::{QueueError, Result};
use crate::sync::SharedLock;

/// The operations a worker pool needs from a queue, whatever backs it.
pub trait WorkQueue {
    /// Enqueues a copy of `item`.
    fn put(&self, item: &[u8]) -> Result<()>;

    /// Blocks until an item is available. `None` once the queue is closed and drained.
    fn get(&self) -> Result<Option<Vec<u8>>>;

    /// Like [`WorkQueue::get`], failing with [`QueueError::Timeout`] after `timeout`.
    fn get_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Number of queued items. Stale as soon as it is returned.
    fn qsize(&self) -> Result<usize>;

    fn empty(&self) -> Result<bool> {
        Ok(self.qsize()? == 0)
    }

    /// Rejects further puts and wakes every blocked `get`.
    fn close(&self) -> Result<()>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum TryGet {
    Item(Vec<u8>),
    /// Nothing queued right now, but producers may still put.
    Empty,
    /// Closed and drained.
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub live_bytes: usize,
    pub pool_size: usize,
    pub closed: bool,
    pub total_puts: u64,
    pub total_gets: u64,
    pub heap: AllocStats,
}

/// A FIFO of byte items living inside a [`SharedMemoryPool`].
///
/// Every process holds its own `SharedQueue` for the same pool; they
/// coordinate through the mutex and event stored in the segment. Nothing here
/// stores a process-local address in shared memory.
pub struct SharedQueue {
    // Dropped before `pool`, which unmaps the memory they point into.
    lock: SharedLock,
    allocator: NodeAllocator,
    header: NonNull<QueueHeader>,
    wait_slice: Duration,
    pool: SharedMemoryPool,
}

enum Popped {
    Item { item: Vec<u8>, wake_next: bool },
    Empty,
    Closed,
}

impl SharedQueue {
    /// Creates the pool named in `cfg` and lays out an empty queue in it.
    pub fn create(cfg: &ShmemConfig) -> Result<SharedQueue> {
        cfg.validate()?;
        let pool = SharedMemoryPool::create(&cfg.name, cfg.size)?;
        match unsafe { Self::init_layout(&pool, cfg) } {
            Ok((lock, header)) => {
                info!(pool = %pool.name(), size = pool.size(), "queue initialized");
                Ok(Self::from_parts(pool, lock, header, cfg))
            }
            Err(e) => {
                warn!(pool = %pool.name(), error = %e, "queue initialization failed, removing pool");
                pool.destroy();
                Err(e)
            }
        }
    }

    /// Attaches to a queue another process created.
    pub fn attach(cfg: &ShmemConfig) -> Result<SharedQueue> {
        let pool = SharedMemoryPool::attach(&cfg.name)?;
        let header = pool.at(HEADER_OFFSET as u64, mem::size_of::<QueueHeader>())? as *mut QueueHeader;
        let header = NonNull::new(header).ok_or_else(|| QueueError::corruption("null header"))?;

        wait_for_magic(header, attach_timeout(cfg))?;
        let (version, pool_size, heap) = unsafe {
            let h = header.as_ref();
            (h.version, h.pool_size, h.heap)
        };
        if version != LAYOUT_VERSION {
            return Err(QueueError::corruption(format!("unknown layout version {}", version)));
        }
        if pool_size as usize > pool.size() || heap.end != pool_size || heap.top > heap.end || heap.start != HEAP_OFFSET as u64 {
            return Err(QueueError::corruption(format!(
                "header describes a {} byte pool with heap {:?}, mapping has {} bytes",
                pool_size,
                heap,
                pool.size()
            )));
        }
        let lock = unsafe { SharedLock::attach(pool.base(), header.as_ptr() as *mut u8, cfg.lock_timeout())? };
        debug!(pool = %pool.name(), base = ?pool.base(), "queue attached");
        Ok(Self::from_parts(pool, lock, header, cfg))
    }

    unsafe fn init_layout(pool: &SharedMemoryPool, cfg: &ShmemConfig) -> Result<(SharedLock, NonNull<QueueHeader>)> {
        let header = pool.at(HEADER_OFFSET as u64, mem::size_of::<QueueHeader>())? as *mut QueueHeader;
        let header = NonNull::new(header).ok_or_else(|| QueueError::corruption("null header"))?;
        let lock = SharedLock::init(pool.base(), header.as_ptr() as *mut u8, cfg.lock_timeout())?;

        let h = &mut *header.as_ptr();
        h.version = LAYOUT_VERSION;
        h.pool_size = pool.size() as u64;
        NodeAllocator::init(&mut h.heap, HEAP_OFFSET, pool.size());
        h.head = NIL;
        h.tail = NIL;
        h.count = 0;
        h.live_bytes = 0;
        h.closed = 0;
        h.total_puts = 0;
        h.total_gets = 0;
        h.magic.store(QUEUE_MAGIC, Ordering::Release);
        Ok((lock, header))
    }

    fn from_parts(pool: SharedMemoryPool, lock: SharedLock, header: NonNull<QueueHeader>, cfg: &ShmemConfig) -> SharedQueue {
        let allocator = unsafe { NodeAllocator::new(pool.base()) };
        SharedQueue {
            lock,
            allocator,
            header,
            wait_slice: cfg.wait_slice(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        self.pool.name()
    }

    pub fn pool(&self) -> &SharedMemoryPool {
        &self.pool
    }

    /// Only valid while the shared mutex is held.
    #[allow(clippy::mut_from_ref)]
    unsafe fn header(&self) -> &mut QueueHeader {
        &mut *self.header.as_ptr()
    }

    pub(crate) fn lock(&self) -> Result<LockGuard<'_>> {
        self.lock.lock()
    }

    pub fn put(&self, item: &[u8]) -> Result<()> {
        {
            let _guard = self.lock()?;
            let h = unsafe { self.header() };
            if h.closed != 0 {
                return Err(QueueError::QueueClosed);
            }
            let node = self.allocator.allocate(&mut h.heap, item.len()).map_err(|e| {
                debug!(pool = %self.name(), len = item.len(), error = %e, "put rejected");
                e
            })?;
            self.allocator.payload_mut(&h.heap, node)?.copy_from_slice(item);

            if h.tail == NIL {
                if h.head != NIL || h.count != 0 {
                    return Err(QueueError::corruption(format!(
                        "tail is null but head is {} with {} items",
                        h.head, h.count
                    )));
                }
                h.head = node;
            } else {
                let tail = self.allocator.live(&h.heap, h.tail)?;
                if tail.next != NIL {
                    return Err(QueueError::corruption(format!("tail node {} links to {}", h.tail, tail.next)));
                }
                tail.next = node;
            }
            h.tail = node;
            h.count += 1;
            h.live_bytes += item.len() as u64;
            h.total_puts += 1;
        }
        self.lock.notify();
        Ok(())
    }

    pub fn get(&self) -> Result<Option<Vec<u8>>> {
        self.get_until(None)
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.get_until(Some(timeout))
    }

    /// Takes the head item without blocking on an empty queue.
    pub fn try_get(&self) -> Result<TryGet> {
        self.try_get_within(None)
    }

    fn try_get_within(&self, limit: Option<Duration>) -> Result<TryGet> {
        let popped = {
            let _guard = self.lock.lock_within(limit)?;
            self.pop_locked()?
        };
        Ok(match popped {
            Popped::Item { item, wake_next } => {
                if wake_next {
                    self.lock.notify();
                }
                TryGet::Item(item)
            }
            Popped::Empty => TryGet::Empty,
            Popped::Closed => TryGet::Closed,
        })
    }

    fn get_until(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // The lock wait counts against the caller's deadline too.
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let attempt = self.try_get_within(remaining).map_err(|e| match (e, timeout) {
                (QueueError::Timeout(_), Some(timeout)) => QueueError::Timeout(timeout),
                (e, _) => e,
            });
            match attempt? {
                TryGet::Item(item) => return Ok(Some(item)),
                TryGet::Closed => {
                    // Pass the wake-up on so every blocked consumer sees the closure.
                    self.lock.notify();
                    return Ok(None);
                }
                TryGet::Empty => {}
            }
            let slice = match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Timeout(timeout));
                    }
                    (deadline - now).min(self.wait_slice)
                }
                _ => self.wait_slice,
            };
            self.lock.wait(slice);
        }
    }

    /// Unlinks the head node and returns its payload. Caller holds the mutex.
    fn pop_locked(&self) -> Result<Popped> {
        let h = unsafe { self.header() };
        if h.count == 0 {
            if h.head != NIL || h.tail != NIL {
                return Err(QueueError::corruption(format!(
                    "empty queue has head {} and tail {}",
                    h.head, h.tail
                )));
            }
            return Ok(if h.closed != 0 { Popped::Closed } else { Popped::Empty });
        }

        let node = h.head;
        if node == NIL {
            return Err(QueueError::corruption(format!("{} items queued but head is null", h.count)));
        }
        let next = self.allocator.live(&h.heap, node)?.next;
        let item = self.allocator.payload(&h.heap, node)?.to_vec();
        if next == NIL {
            if h.tail != node || h.count != 1 {
                return Err(QueueError::corruption(format!(
                    "list ends at {} but tail is {} with {} items",
                    node, h.tail, h.count
                )));
            }
            h.tail = NIL;
        }
        h.head = next;
        self.allocator.free(&mut h.heap, node)?;
        h.count -= 1;
        h.live_bytes -= item.len() as u64;
        h.total_gets += 1;
        Ok(Popped::Item {
            item,
            wake_next: h.count > 0 || h.closed != 0,
        })
    }

    pub fn qsize(&self) -> Result<usize> {
        let _guard = self.lock()?;
        Ok(unsafe { self.header() }.count as usize)
    }

    pub fn empty(&self) -> Result<bool> {
        Ok(self.qsize()? == 0)
    }

    pub fn close(&self) -> Result<()> {
        {
            let _guard = self.lock()?;
            let h = unsafe { self.header() };
            if h.closed == 0 {
                h.closed = 1;
                info!(pool = %self.name(), remaining = h.count, "queue closed");
            }
        }
        self.lock.notify();
        Ok(())
    }

    pub fn is_closed(&self) -> Result<bool> {
        let _guard = self.lock()?;
        Ok(unsafe { self.header() }.closed != 0)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let _guard = self.lock()?;
        let h = unsafe { self.header() };
        Ok(QueueStats {
            len: h.count as usize,
            live_bytes: h.live_bytes as usize,
            pool_size: h.pool_size as usize,
            closed: h.closed != 0,
            total_puts: h.total_puts,
            total_gets: h.total_gets,
            heap: self.allocator.stats(&h.heap)?,
        })
    }

    /// Unmaps this process's view. Other attachments are unaffected.
    pub fn detach(self) {
        let SharedQueue { lock, pool, .. } = self;
        drop(lock);
        pool.detach();
    }

    /// Removes the pool from the system namespace and unmaps this view.
    ///
    /// Callers must make sure no other process still uses the queue: nothing
    /// in the segment tracks attachments.
    pub fn destroy(self) {
        let SharedQueue { lock, pool, .. } = self;
        drop(lock);
        pool.destroy();
    }
}

impl WorkQueue for SharedQueue {
    fn put(&self, item: &[u8]) -> Result<()> {
        SharedQueue::put(self, item)
    }

    fn get(&self) -> Result<Option<Vec<u8>>> {
        SharedQueue::get(self)
    }

    fn get_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        SharedQueue::get_timeout(self, timeout)
    }

    fn qsize(&self) -> Result<usize> {
        SharedQueue::qsize(self)
    }

    fn close(&self) -> Result<()> {
        SharedQueue::close(self)
    }
}

fn attach_timeout(cfg: &ShmemConfig) -> Duration {
    cfg.lock_timeout().unwrap_or(Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS))
}

/// The creator publishes the magic after the primitives and header are in
/// place; until then the segment must not be touched.
fn wait_for_magic(header: NonNull<QueueHeader>, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let magic = unsafe { header.as_ref() }.magic.load(Ordering::Acquire);
        if magic == QUEUE_MAGIC {
            return Ok(());
        }
        if magic != 0 {
            return Err(QueueError::corruption(format!("bad magic {:#x}", magic)));
        }
        if Instant::now() >= deadline {
            return Err(QueueError::Timeout(timeout));
        }
        thread::sleep(Duration::from_millis(1));
    }
}
