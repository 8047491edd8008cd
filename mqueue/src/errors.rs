use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MqError {
    #[error("invalid message queue handle")]
    InvalidHandle,

    #[error("message queue '{0}' does not exist")]
    QueueUnavailable(String),

    #[error("message queue '{0}' already exists")]
    QueueExists(String),

    #[error("message queue is full")]
    QueueFull,

    #[error("message queue is empty")]
    QueueEmpty,

    #[error("payload of {len} bytes exceeds the maximum message size of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("timed out waiting on the message queue")]
    TimedOut,

    #[error("invalid queue attributes: {0}")]
    InvalidAttributes(String),

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    // raw_sync hands back Box<dyn Error>, which is neither Send nor Sync.
    #[error("lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("handle table mutex was poisoned")]
    PoisonedLock,

    #[error("logic error: {0}")]
    Logic(String),
}

pub type Result<T> = std::result::Result<T, MqError>;

impl<T> From<std::sync::PoisonError<T>> for MqError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        MqError::PoisonedLock
    }
}

#[inline]
pub(crate) fn lock_err(e: Box<dyn std::error::Error>) -> MqError {
    MqError::Lock(e.to_string())
}
