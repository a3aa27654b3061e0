// Lazy destination registries, owned by the dispatcher.
use std::collections::HashMap;
use std::sync::Arc;

use stampede_storage::QueueStore;

use crate::queue::Queue;
use crate::status::{QueueStatus, TopicStatus};
use crate::topic::Topic;

#[derive(Debug)]
pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    queues: HashMap<String, Queue>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            queues: HashMap::new(),
        }
    }

    /// Existing queue for `destination`, created on first use.
    pub fn find(&mut self, destination: &str) -> &mut Queue {
        self.queues
            .entry(destination.to_string())
            .or_insert_with(|| Queue::new(destination.to_string(), Arc::clone(&self.store)))
    }

    pub fn remove_connection(&mut self, conn_id: u64) {
        for queue in self.queues.values_mut() {
            queue.remove_connection(conn_id);
        }
    }

    pub async fn status(&mut self) -> Vec<QueueStatus> {
        let mut statuses = Vec::with_capacity(self.queues.len());
        for queue in self.queues.values_mut() {
            statuses.push(queue.status().await);
        }
        statuses
    }
}

#[derive(Debug, Default)]
pub struct TopicManager {
    topics: HashMap<String, Topic>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing topic for `destination`, created on first use.
    pub fn find(&mut self, destination: &str) -> &mut Topic {
        self.topics
            .entry(destination.to_string())
            .or_insert_with(|| Topic::new(destination.to_string()))
    }

    pub fn remove_connection(&mut self, conn_id: u64) {
        for topic in self.topics.values_mut() {
            topic.remove_connection(conn_id);
        }
    }

    pub fn status(&mut self) -> Vec<TopicStatus> {
        self.topics.values_mut().map(|t| t.status()).collect()
    }
}
