use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The segment could not be created, sized or mapped.
    #[error("failed to allocate shared memory pool {name:?}: {reason}")]
    Allocation { name: String, reason: String },

    #[error("shared memory pool {0:?} does not exist")]
    NotFound(String),

    #[error("out of space: {requested} bytes requested, pool exhausted")]
    OutOfSpace { requested: usize },

    #[error("queue is closed")]
    QueueClosed,

    /// A header or free-list invariant was violated. Never repaired.
    #[error("shared memory corruption: {0}")]
    Corruption(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    // raw_sync hands back Box<dyn Error> without Send + Sync, so only the message survives.
    #[error("lock error: {0}")]
    Lock(String),

    #[error("mutex was poisoned")]
    PoisonedLock,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> Self {
        QueueError::Lock(err.to_string())
    }

    pub(crate) fn corruption<S: Into<String>>(msg: S) -> Self {
        QueueError::Corruption(msg.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for QueueError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        QueueError::PoisonedLock
    }
}
