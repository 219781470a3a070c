use std::time::Duration;

use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use tracing::{debug, trace, warn};

use crate::core::{EVENT_OFFSET, LOCK_REGION_SIZE, MUTEX_OFFSET};
use crate::errors::{QueueError, Result};

/// The mutex guarding the queue header and the "work available" event, both
/// living at the front of the segment and shared between processes.
///
/// The event is auto-reset: one `notify` releases one waiter. Waiters that
/// leave something behind for others (items or closure) notify again.
pub(crate) struct SharedLock {
    mutex: Box<dyn LockImpl>,
    work_available: Box<dyn EventImpl>,
    lock_timeout: Option<Duration>,
}

impl SharedLock {
    /// Initializes both primitives in a fresh segment.
    ///
    /// # Safety
    /// `base` must point at a mapped, zeroed segment of at least
    /// `2 * LOCK_REGION_SIZE` bytes that no other process uses yet.
    pub unsafe fn init(base: *mut u8, data: *mut u8, lock_timeout: Option<Duration>) -> Result<SharedLock> {
        let mutex_mem = base.add(MUTEX_OFFSET);
        let event_mem = base.add(EVENT_OFFSET);
        check_fits("mutex", Mutex::size_of(Some(mutex_mem)))?;
        check_fits("event", Event::size_of(Some(event_mem)))?;

        let (mutex, _) = Mutex::new(mutex_mem, data).map_err(QueueError::lock)?;
        let (work_available, _) = Event::new(event_mem, true).map_err(QueueError::lock)?;
        debug!("initialized process-shared mutex and event");
        Ok(SharedLock { mutex, work_available, lock_timeout })
    }

    /// Binds to primitives another process initialized.
    ///
    /// # Safety
    /// `base` must point at a segment whose primitives were set up by [`SharedLock::init`].
    pub unsafe fn attach(base: *mut u8, data: *mut u8, lock_timeout: Option<Duration>) -> Result<SharedLock> {
        let (mutex, _) = Mutex::from_existing(base.add(MUTEX_OFFSET), data).map_err(QueueError::lock)?;
        let (work_available, _) = Event::from_existing(base.add(EVENT_OFFSET)).map_err(QueueError::lock)?;
        Ok(SharedLock { mutex, work_available, lock_timeout })
    }

    /// Takes the mutex, giving up after the configured lock timeout.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.lock_within(None)
    }

    /// Like [`SharedLock::lock`], but never waits longer than `limit`.
    pub fn lock_within(&self, limit: Option<Duration>) -> Result<LockGuard<'_>> {
        let timeout = match (self.lock_timeout, limit) {
            (Some(configured), Some(limit)) => Some(configured.min(limit)),
            (configured, limit) => configured.or(limit),
        };
        match timeout {
            None => self.mutex.lock().map_err(QueueError::lock),
            Some(timeout) => self.mutex.try_lock(Timeout::Val(timeout)).map_err(|e| {
                debug!(error = %e, ?timeout, "shared mutex not acquired");
                QueueError::Timeout(timeout)
            }),
        }
    }

    /// Signals the event. Callers notify after committing a change, so a
    /// failure is only logged; waiters still re-check every wait slice.
    pub fn notify(&self) {
        if let Err(e) = self.work_available.set(EventState::Signaled) {
            warn!(error = %e, "work-available event not signaled");
        }
    }

    /// Sleeps until notified or `slice` elapses. Callers re-check the header
    /// either way, so an expired wait is not an error.
    pub fn wait(&self, slice: Duration) {
        if let Err(e) = self.work_available.wait(Timeout::Val(slice)) {
            trace!(error = %e, ?slice, "wait slice ended without a signal");
        }
    }
}

fn check_fits(what: &str, needed: usize) -> Result<()> {
    if needed > LOCK_REGION_SIZE {
        return Err(QueueError::Allocation {
            name: String::new(),
            reason: format!("{} needs {} bytes, only {} are reserved", what, needed, LOCK_REGION_SIZE),
        });
    }
    Ok(())
}
