use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{QueueError, Result};
use crate::queue::WorkQueue;

/// In-process backend for [`WorkQueue`], for pools whose workers are threads.
#[derive(Default)]
pub struct LocalQueue {
    state: Mutex<LocalState>,
    available: Condvar,
}

#[derive(Default)]
struct LocalState {
    items: VecDeque<Vec<u8>>,
    closed: bool,
}

impl LocalQueue {
    pub fn new() -> LocalQueue {
        LocalQueue::default()
    }

    fn get_until(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock()?;
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            if state.closed {
                return Ok(None);
            }
            state = match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Timeout(timeout));
                    }
                    self.available.wait_timeout(state, deadline - now)?.0
                }
                _ => self.available.wait(state)?,
            };
        }
    }
}

impl WorkQueue for LocalQueue {
    fn put(&self, item: &[u8]) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Err(QueueError::QueueClosed);
        }
        state.items.push_back(item.to_vec());
        self.available.notify_one();
        Ok(())
    }

    fn get(&self) -> Result<Option<Vec<u8>>> {
        self.get_until(None)
    }

    fn get_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.get_until(Some(timeout))
    }

    fn qsize(&self) -> Result<usize> {
        Ok(self.state.lock()?.items.len())
    }

    fn close(&self) -> Result<()> {
        self.state.lock()?.closed = true;
        self.available.notify_all();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    /// Behaviour every backend shares. Leaves the queue closed.
    pub(crate) fn exercise_work_queue<Q: WorkQueue>(queue: &Q) -> Result<()> {
        assert!(queue.empty()?);
        queue.put(b"a")?;
        queue.put(b"b")?;
        queue.put(b"c")?;
        assert_eq!(queue.qsize()?, 3);
        assert_eq!(queue.get()?, Some(b"a".to_vec()));
        assert_eq!(queue.get_timeout(Duration::from_millis(10))?, Some(b"b".to_vec()));
        queue.close()?;
        assert!(matches!(queue.put(b"d"), Err(QueueError::QueueClosed)));
        assert_eq!(queue.get()?, Some(b"c".to_vec()));
        assert!(queue.empty()?);
        assert_eq!(queue.get()?, None);
        Ok(())
    }

    #[test]
    fn local_queue_behaves_like_a_work_queue() -> Result<()> {
        exercise_work_queue(&LocalQueue::new())
    }

    #[test]
    fn get_timeout_expires() {
        let queue = LocalQueue::new();
        let timeout = Duration::from_millis(20);
        assert!(matches!(queue.get_timeout(timeout), Err(QueueError::Timeout(t)) if t == timeout));
    }

    #[test]
    fn close_wakes_blocked_consumers() -> Result<()> {
        let queue = Arc::new(LocalQueue::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.get())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        queue.close()?;
        for consumer in consumers {
            assert_eq!(consumer.join().expect("consumer panicked")?, None);
        }
        Ok(())
    }
}
