// Fan-out destination: best-effort broadcast, no acknowledgement.
use stampede_wire::Frame;

use crate::status::TopicStatus;
use crate::sublist::SubscriptionList;
use crate::subscription::{Delivery, SubscriptionRef};

/// Subscribers stay resident across deliveries; a failed hand-off to one of
/// them is logged and skipped without touching the rest.
#[derive(Debug)]
pub struct Topic {
    destination: String,
    subscribers: SubscriptionList,
    total_count: i64,
    current_count: i64,
}

impl Topic {
    pub(crate) fn new(destination: String) -> Self {
        Self {
            destination,
            subscribers: SubscriptionList::new(),
            total_count: 0,
            current_count: 0,
        }
    }

    pub fn subscribe(&mut self, sub: SubscriptionRef) {
        self.subscribers.add(sub);
    }

    pub fn unsubscribe(&mut self, conn_id: u64, sub_id: &str) {
        self.subscribers.remove(conn_id, sub_id);
    }

    pub fn remove_connection(&mut self, conn_id: u64) {
        self.subscribers.remove_connection(conn_id);
    }

    /// Broadcast a frame to every current subscriber. Returns how many
    /// hand-offs succeeded.
    pub fn publish(&mut self, frame: &Frame) -> usize {
        self.total_count += 1;
        self.current_count += 1;
        let mut delivered = 0;
        for sub in self.subscribers.iter() {
            let delivery = Delivery::TopicMessage {
                sub_id: sub.sub_id.clone(),
                frame: frame.clone(),
            };
            match sub.deliveries.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::debug!(
                        destination = %self.destination,
                        conn_id = sub.conn_id,
                        sub_id = %sub.sub_id,
                        "dropping topic frame for unreachable subscriber"
                    );
                }
            }
        }
        delivered
    }

    pub fn status(&mut self) -> TopicStatus {
        let status = TopicStatus {
            dest: self.destination.clone(),
            total_count: self.total_count,
            current_count: self.current_count,
            subscription_count: self.subscribers.len(),
        };
        self.current_count = 0;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::AckMode;
    use bytes::Bytes;
    use stampede_wire::command;
    use tokio::sync::mpsc;

    fn sub(conn_id: u64) -> (SubscriptionRef, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(4);
        (
            SubscriptionRef {
                conn_id,
                sub_id: "t1".to_string(),
                destination: "/topic/y".to_string(),
                ack: AckMode::Auto,
                deliveries: tx,
            },
            rx,
        )
    }

    fn frame() -> Frame {
        Frame::with_body(command::MESSAGE, Bytes::from_static(b"news"))
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let mut topic = Topic::new("/topic/y".to_string());
        let (a, mut rx_a) = sub(1);
        let (b, mut rx_b) = sub(2);
        topic.subscribe(a);
        topic.subscribe(b);

        assert_eq!(topic.publish(&frame()), 2);
        assert!(matches!(
            rx_a.recv().await.expect("a"),
            Delivery::TopicMessage { .. }
        ));
        assert!(matches!(
            rx_b.recv().await.expect("b"),
            Delivery::TopicMessage { .. }
        ));
    }

    #[tokio::test]
    async fn one_dead_subscriber_does_not_block_the_rest() {
        let mut topic = Topic::new("/topic/y".to_string());
        let (dead, rx_dead) = sub(1);
        drop(rx_dead);
        let (alive, mut rx_alive) = sub(2);
        topic.subscribe(dead);
        topic.subscribe(alive);

        assert_eq!(topic.publish(&frame()), 1);
        assert!(rx_alive.recv().await.is_some());
        // Topics never suspend subscribers on delivery.
        assert_eq!(topic.status().subscription_count, 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let mut topic = Topic::new("/topic/y".to_string());
        let (a, mut rx_a) = sub(1);
        topic.subscribe(a);
        topic.unsubscribe(1, "t1");
        assert_eq!(topic.publish(&frame()), 0);
        assert!(rx_a.try_recv().is_err());
    }
}
