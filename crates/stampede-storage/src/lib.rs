// Queue storage: an opaque FIFO per destination.
use async_trait::async_trait;
use std::fmt;
use std::fmt::Debug;

use stampede_wire::Frame;

pub mod memory;
pub use memory::MemoryStore;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageError {
    Backend(String),
    Io(std::io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Backend(reason) => write!(f, "storage backend error: {reason}"),
            StorageError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

/// Per-destination FIFO used by queues.
///
/// Implementations know nothing about subscriptions, and are only ever
/// touched from the dispatcher task; the broker makes no concurrency
/// guarantee beyond that single caller.
#[async_trait]
pub trait QueueStore: Debug + Send + Sync {
    /// Append a frame to the destination's FIFO.
    async fn enqueue(&self, destination: &str, frame: Frame) -> Result<()>;

    /// Remove and return the head frame, or `None` when empty.
    async fn dequeue(&self, destination: &str) -> Result<Option<Frame>>;

    /// Put a frame back at the head, ahead of everything queued behind it.
    async fn requeue(&self, destination: &str, frame: Frame) -> Result<()>;

    /// Number of frames currently held for the destination.
    async fn count(&self, destination: &str) -> Result<usize>;
}
