// In-memory queue storage. Never fails.
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use stampede_wire::Frame;

use crate::{QueueStore, Result};

/// Default storage backend: one `VecDeque` per destination, nothing survives
/// a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, VecDeque<Frame>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<T>(&self, destination: &str, f: impl FnOnce(&mut VecDeque<Frame>) -> T) -> T {
        let mut queues = self.queues.lock().expect("storage lock");
        f(queues.entry(destination.to_string()).or_default())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, destination: &str, frame: Frame) -> Result<()> {
        self.with_queue(destination, |queue| queue.push_back(frame));
        Ok(())
    }

    async fn dequeue(&self, destination: &str) -> Result<Option<Frame>> {
        Ok(self.with_queue(destination, |queue| queue.pop_front()))
    }

    async fn requeue(&self, destination: &str, frame: Frame) -> Result<()> {
        self.with_queue(destination, |queue| queue.push_front(frame));
        Ok(())
    }

    async fn count(&self, destination: &str) -> Result<usize> {
        Ok(self.with_queue(destination, |queue| queue.len()))
    }
}
