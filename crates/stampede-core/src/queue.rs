// Point-to-point destination: storage FIFO married to a waiting list.
use std::sync::Arc;

use stampede_storage::QueueStore;
use stampede_wire::Frame;

use crate::status::QueueStatus;
use crate::sublist::SubscriptionList;
use crate::subscription::{Delivery, SubscriptionRef};
use crate::{CoreError, Result};

/// A queue holds frames until exactly one subscriber acknowledges each.
///
/// A subscription sits in the waiting list iff it has no outstanding frame:
/// delivery removes the handle, and only an explicit re-subscribe (sent by
/// the connection after the ack) puts it back.
#[derive(Debug)]
pub struct Queue {
    destination: String,
    store: Arc<dyn QueueStore>,
    waiting: SubscriptionList,
    total_count: i64,
    current_count: i64,
}

impl Queue {
    pub(crate) fn new(destination: String, store: Arc<dyn QueueStore>) -> Self {
        Self {
            destination,
            store,
            waiting: SubscriptionList::new(),
            total_count: 0,
            current_count: 0,
        }
    }

    /// Add a subscription, or hand it the stored head frame straight away.
    pub async fn subscribe(&mut self, sub: SubscriptionRef) -> Result<()> {
        match self
            .store
            .dequeue(&self.destination)
            .await
            .map_err(|err| CoreError::storage(&self.destination, err))?
        {
            Some(frame) => self.deliver(sub, frame).await,
            None => {
                self.waiting.add(sub);
                Ok(())
            }
        }
    }

    pub fn unsubscribe(&mut self, conn_id: u64, sub_id: &str) {
        self.waiting.remove(conn_id, sub_id);
    }

    pub fn remove_connection(&mut self, conn_id: u64) {
        self.waiting.remove_connection(conn_id);
    }

    /// Route a new frame: to a waiting subscriber if any, else to storage.
    pub async fn enqueue(&mut self, frame: Frame) -> Result<()> {
        self.total_count += 1;
        self.current_count += 1;
        match self.waiting.take_next() {
            Some(sub) => self.deliver(sub, frame).await,
            None => self
                .store
                .enqueue(&self.destination, frame)
                .await
                .map_err(|err| CoreError::storage(&self.destination, err)),
        }
    }

    /// Put a frame back at the head after a failed delivery. Counters are not
    /// bumped again; the frame was already counted on its first enqueue.
    pub async fn requeue(&mut self, frame: Frame) -> Result<()> {
        match self.waiting.take_next() {
            Some(sub) => self.deliver(sub, frame).await,
            None => self
                .store
                .requeue(&self.destination, frame)
                .await
                .map_err(|err| CoreError::storage(&self.destination, err)),
        }
    }

    async fn deliver(&mut self, sub: SubscriptionRef, frame: Frame) -> Result<()> {
        let delivery = Delivery::QueueMessage {
            sub_id: sub.sub_id.clone(),
            frame,
        };
        match sub.deliveries.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Connection gone or its channel saturated; the handle is
                // dropped and the frame goes back to the head of the queue.
                tracing::warn!(
                    destination = %self.destination,
                    conn_id = sub.conn_id,
                    sub_id = %sub.sub_id,
                    "queue delivery failed, requeueing frame"
                );
                let frame = match err.into_inner() {
                    Delivery::QueueMessage { frame, .. } => frame,
                    _ => unreachable!("queue delivery variant"),
                };
                self.store
                    .requeue(&self.destination, frame)
                    .await
                    .map_err(|err| CoreError::storage(&self.destination, err))
            }
        }
    }

    /// Snapshot the queue's counters; the per-interval count resets.
    pub async fn status(&mut self) -> QueueStatus {
        let message_count = match self.store.count(&self.destination).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(destination = %self.destination, error = %err, "storage count failed");
                0
            }
        };
        let status = QueueStatus {
            dest: self.destination.clone(),
            message_count,
            total_count: self.total_count,
            current_count: self.current_count,
            subscription_count: self.waiting.len(),
        };
        self.current_count = 0;
        status
    }
}
