// The single serialization point: owns every destination and the connection
// table, consumes typed requests, and periodically publishes a status frame.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use stampede_storage::QueueStore;
use stampede_wire::{Frame, command, header};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::manager::{QueueManager, TopicManager};
use crate::request::Request;
use crate::status::{
    ClientStatus, STATUS_SEVERITY, ServerStatus, StatusSource, SubscriptionStatus,
};
use crate::subscription::{ConnectionHandle, Delivery};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Destinations under this prefix are queues; everything else is a topic.
    pub queue_prefix: String,
    /// Topic the periodic status frame is published to.
    pub status_destination: String,
    pub status_interval: Duration,
    /// Bound of the inbound request channel. Producers block when it is
    /// full, which throttles misbehaving clients.
    pub request_queue_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_prefix: "/queue/".to_string(),
            status_destination: "/topic/stampede.status".to_string(),
            status_interval: Duration::from_secs(5),
            request_queue_depth: 128,
        }
    }
}

#[derive(Debug, Default)]
struct RunCounters {
    enqueue: u64,
    requeue: u64,
    connect: u64,
    disconnect: u64,
    current_enqueue: u64,
    current_requeue: u64,
    current_connect: u64,
    current_disconnect: u64,
}

impl RunCounters {
    fn reset_current(&mut self) {
        self.current_enqueue = 0;
        self.current_requeue = 0;
        self.current_connect = 0;
        self.current_disconnect = 0;
    }
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    // sub id -> destination, for status reporting.
    subscriptions: HashMap<String, String>,
}

/// Consumes requests serially; all routing state is mutated from `run` only.
pub struct Dispatcher {
    config: DispatcherConfig,
    queues: QueueManager,
    topics: TopicManager,
    connections: HashMap<u64, ConnectionEntry>,
    status: Box<dyn StatusSource>,
    counters: RunCounters,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn QueueStore>,
        status: Box<dyn StatusSource>,
    ) -> Self {
        Self {
            config,
            queues: QueueManager::new(store),
            topics: TopicManager::new(),
            connections: HashMap::new(),
            status,
            counters: RunCounters::default(),
        }
    }

    /// Drive the dispatch loop until every request sender is gone.
    pub async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let mut ticker = tokio::time::interval(self.config.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval fires immediately once; swallow that tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_status().await,
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }
        tracing::info!("dispatcher stopped");
    }

    async fn handle(&mut self, request: Request) {
        metrics::counter!("stampede_dispatch_requests_total").increment(1);
        match request {
            Request::Connected { conn } => {
                self.counters.connect += 1;
                self.counters.current_connect += 1;
                tracing::info!(conn_id = conn.id, address = %conn.info.address, "connection registered");
                self.connections.insert(
                    conn.id,
                    ConnectionEntry {
                        handle: conn,
                        subscriptions: HashMap::new(),
                    },
                );
            }
            Request::Subscribe { sub, receipt } => {
                let conn_id = sub.conn_id;
                let destination = sub.destination.clone();
                if let Some(entry) = self.connections.get_mut(&conn_id) {
                    entry
                        .subscriptions
                        .insert(sub.sub_id.clone(), destination.clone());
                }
                if self.is_queue(&destination) {
                    if let Err(err) = self.queues.find(&destination).subscribe(sub).await {
                        tracing::error!(error = %err, destination = %destination, "queue subscribe failed");
                        self.send_frame(conn_id, Frame::error(&err.to_string()));
                        return;
                    }
                } else {
                    self.topics.find(&destination).subscribe(sub);
                }
                self.send_receipt(conn_id, receipt);
            }
            Request::Unsubscribe {
                conn_id,
                sub_id,
                destination,
                receipt,
            } => {
                if let Some(entry) = self.connections.get_mut(&conn_id) {
                    entry.subscriptions.remove(&sub_id);
                }
                if self.is_queue(&destination) {
                    self.queues.find(&destination).unsubscribe(conn_id, &sub_id);
                } else {
                    self.topics.find(&destination).unsubscribe(conn_id, &sub_id);
                }
                self.send_receipt(conn_id, receipt);
            }
            Request::Enqueue {
                conn_id,
                frame,
                receipt,
            } => {
                self.counters.enqueue += 1;
                self.counters.current_enqueue += 1;
                // The connection layer rejects SEND without a destination.
                let Some(destination) = frame.destination().map(str::to_string) else {
                    tracing::error!(conn_id, "enqueue request without destination dropped");
                    return;
                };
                metrics::counter!("stampede_frames_routed_total").increment(1);
                if self.is_queue(&destination) {
                    match self.queues.find(&destination).enqueue(frame).await {
                        Ok(()) => self.send_receipt(conn_id, receipt),
                        Err(err) => {
                            tracing::error!(error = %err, destination = %destination, "enqueue failed");
                            let mut error = Frame::error(&err.to_string());
                            if let Some(receipt_id) = receipt {
                                error.headers.push(header::RECEIPT_ID, receipt_id);
                            }
                            self.send_frame(conn_id, error);
                        }
                    }
                } else {
                    self.topics.find(&destination).publish(&frame);
                    self.send_receipt(conn_id, receipt);
                }
            }
            Request::Requeue { frame } => {
                self.counters.requeue += 1;
                self.counters.current_requeue += 1;
                let Some(destination) = frame.destination().map(str::to_string) else {
                    tracing::error!("requeue request without destination dropped");
                    return;
                };
                if self.is_queue(&destination) {
                    if let Err(err) = self.queues.find(&destination).requeue(frame).await {
                        tracing::error!(error = %err, destination = %destination, "requeue failed");
                    }
                } else {
                    // Requeue only makes sense for queues; drop rather than
                    // panic to survive a misbehaving caller.
                    tracing::warn!(destination = %destination, "requeue to a topic dropped");
                }
            }
            Request::Disconnected { conn_id } => {
                self.counters.disconnect += 1;
                self.counters.current_disconnect += 1;
                self.connections.remove(&conn_id);
                self.queues.remove_connection(conn_id);
                self.topics.remove_connection(conn_id);
                tracing::info!(conn_id, "connection purged");
            }
        }
    }

    fn is_queue(&self, destination: &str) -> bool {
        destination.starts_with(&self.config.queue_prefix)
    }

    fn send_receipt(&self, conn_id: u64, receipt: Option<String>) {
        if let Some(receipt_id) = receipt {
            self.send_frame(conn_id, Frame::receipt_for(&receipt_id));
        }
    }

    fn send_frame(&self, conn_id: u64, frame: Frame) {
        if let Some(entry) = self.connections.get(&conn_id)
            && entry
                .handle
                .deliveries
                .try_send(Delivery::Server(frame))
                .is_err()
        {
            tracing::debug!(conn_id, "dropping server frame for unreachable connection");
        }
    }

    async fn publish_status(&mut self) {
        let queues = self.queues.status().await;
        let topics = self.topics.status();
        let clients: Vec<ClientStatus> = self
            .connections
            .values()
            .map(|entry| ClientStatus {
                id: entry.handle.id,
                address: entry.handle.info.address.clone(),
                login: entry.handle.info.login.clone(),
                time: entry.handle.info.connected_at.clone(),
                subscriptions: entry
                    .subscriptions
                    .iter()
                    .map(|(id, dest)| SubscriptionStatus {
                        id: id.clone(),
                        dest: dest.clone(),
                    })
                    .collect(),
            })
            .collect();

        let interval_secs = self.config.status_interval.as_secs_f64().max(1e-3);
        let status = ServerStatus {
            total_current_count: queues.iter().map(|q| q.current_count).sum(),
            total_queue_count: queues.iter().map(|q| q.message_count).sum(),
            clients,
            queues,
            topics,
            time: self.status.timestamp_utc(),
            kind: "status".to_string(),
            id: self.status.server_id(),
            name: self.status.server_name(),
            subtype: "server".to_string(),
            subsystem: "processor".to_string(),
            computer_name: self.status.hostname(),
            user_name: self.status.username(),
            process_name: self.status.process_name(),
            version: self.status.server_version(),
            pid: self.status.pid(),
            tid: 0,
            severity: STATUS_SEVERITY,
            message: String::new(),
            enqueue_count: self.counters.enqueue,
            requeue_count: self.counters.requeue,
            connect_count: self.counters.connect,
            disconnect_count: self.counters.disconnect,
            current_enqueue_count: self.counters.current_enqueue,
            current_requeue_count: self.counters.current_requeue,
            current_connect_count: self.counters.current_connect,
            current_disconnect_count: self.counters.current_disconnect,
            message_rate: self.counters.current_enqueue as f64 / interval_secs,
        };
        let body = match serde_json::to_vec(&status) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                tracing::error!(error = %err, "status serialization failed");
                return;
            }
        };
        let mut frame = Frame::with_body(command::MESSAGE, body);
        frame
            .headers
            .push(header::DESTINATION, self.config.status_destination.clone());
        frame.headers.push(header::CONTENT_TYPE, "application/json");
        let destination = self.config.status_destination.clone();
        self.topics.find(&destination).publish(&frame);
        self.counters.reset_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{AckMode, ConnectionInfo, SubscriptionRef};
    use stampede_storage::MemoryStore;
    use tokio::time::timeout;

    struct FixedStatusSource;

    impl StatusSource for FixedStatusSource {
        fn server_id(&self) -> String {
            "broker-test".to_string()
        }
        fn server_name(&self) -> String {
            "stampede".to_string()
        }
        fn server_version(&self) -> String {
            "0.0.0".to_string()
        }
        fn hostname(&self) -> String {
            "testhost".to_string()
        }
        fn username(&self) -> String {
            "tester".to_string()
        }
        fn process_name(&self) -> String {
            "stampede-test".to_string()
        }
        fn pid(&self) -> u32 {
            1
        }
        fn timestamp_utc(&self) -> String {
            "2026-01-01T00:00:00".to_string()
        }
    }

    fn spawn_dispatcher(config: DispatcherConfig) -> mpsc::Sender<Request> {
        let depth = config.request_queue_depth;
        let dispatcher = Dispatcher::new(
            config,
            Arc::new(MemoryStore::new()),
            Box::new(FixedStatusSource),
        );
        let (tx, rx) = mpsc::channel(depth);
        tokio::spawn(dispatcher.run(rx));
        tx
    }

    fn connect(id: u64) -> (ConnectionHandle, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(16);
        (
            ConnectionHandle {
                id,
                deliveries: tx,
                info: ConnectionInfo {
                    address: "127.0.0.1:1000".to_string(),
                    login: "u".to_string(),
                    connected_at: "2026-01-01T00:00:00".to_string(),
                },
            },
            rx,
        )
    }

    fn sub_ref(conn: &ConnectionHandle, sub_id: &str, destination: &str) -> SubscriptionRef {
        SubscriptionRef {
            conn_id: conn.id,
            sub_id: sub_id.to_string(),
            destination: destination.to_string(),
            ack: AckMode::ClientIndividual,
            deliveries: conn.deliveries.clone(),
        }
    }

    fn send_frame(destination: &str, body: &'static [u8]) -> Frame {
        let mut frame = Frame::with_body(command::MESSAGE, Bytes::from_static(body));
        frame.headers.push(header::DESTINATION, destination);
        frame
    }

    async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn queue_enqueue_reaches_waiting_subscriber() {
        let tx = spawn_dispatcher(DispatcherConfig::default());
        let (conn, mut rx) = connect(1);
        let sub = sub_ref(&conn, "s1", "/queue/x");
        tx.send(Request::Connected { conn }).await.expect("send");
        tx.send(Request::Subscribe { sub, receipt: None })
            .await
            .expect("send");
        tx.send(Request::Enqueue {
            conn_id: 1,
            frame: send_frame("/queue/x", b"hello"),
            receipt: None,
        })
        .await
        .expect("send");

        match recv(&mut rx).await {
            Delivery::QueueMessage { sub_id, frame } => {
                assert_eq!(sub_id, "s1");
                assert_eq!(frame.body, Bytes::from_static(b"hello"));
            }
            other => panic!("expected queue message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_receipt_is_answered_after_the_effect() {
        let tx = spawn_dispatcher(DispatcherConfig::default());
        let (conn, mut rx) = connect(1);
        tx.send(Request::Connected { conn }).await.expect("send");
        tx.send(Request::Enqueue {
            conn_id: 1,
            frame: send_frame("/queue/x", b"stored"),
            receipt: Some("r-7".to_string()),
        })
        .await
        .expect("send");

        match recv(&mut rx).await {
            Delivery::Server(frame) => {
                assert_eq!(frame.command, command::RECEIPT);
                assert_eq!(frame.headers.get(header::RECEIPT_ID), Some("r-7"));
            }
            other => panic!("expected receipt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requeue_to_a_topic_is_dropped_not_fatal() {
        let tx = spawn_dispatcher(DispatcherConfig::default());
        let (conn, mut rx) = connect(1);
        let sub = sub_ref(&conn, "s1", "/queue/x");
        tx.send(Request::Connected { conn }).await.expect("send");
        tx.send(Request::Requeue {
            frame: send_frame("/topic/y", b"bogus"),
        })
        .await
        .expect("send");
        // The dispatcher survives and keeps routing.
        tx.send(Request::Subscribe { sub, receipt: None })
            .await
            .expect("send");
        tx.send(Request::Enqueue {
            conn_id: 1,
            frame: send_frame("/queue/x", b"still alive"),
            receipt: None,
        })
        .await
        .expect("send");
        assert!(matches!(
            recv(&mut rx).await,
            Delivery::QueueMessage { .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_purges_waiting_subscriptions() {
        let tx = spawn_dispatcher(DispatcherConfig::default());
        let (gone, _rx_gone) = connect(1);
        let gone_sub = sub_ref(&gone, "s1", "/queue/x");
        tx.send(Request::Connected { conn: gone }).await.expect("send");
        tx.send(Request::Subscribe {
            sub: gone_sub,
            receipt: None,
        })
        .await
        .expect("send");
        tx.send(Request::Disconnected { conn_id: 1 })
            .await
            .expect("send");

        // The frame must land in storage, then flow to the next subscriber.
        tx.send(Request::Enqueue {
            conn_id: 1,
            frame: send_frame("/queue/x", b"redelivered"),
            receipt: None,
        })
        .await
        .expect("send");
        let (fresh, mut rx_fresh) = connect(2);
        let fresh_sub = sub_ref(&fresh, "s9", "/queue/x");
        tx.send(Request::Connected { conn: fresh }).await.expect("send");
        tx.send(Request::Subscribe {
            sub: fresh_sub,
            receipt: None,
        })
        .await
        .expect("send");

        match recv(&mut rx_fresh).await {
            Delivery::QueueMessage { frame, .. } => {
                assert_eq!(frame.body, Bytes::from_static(b"redelivered"));
            }
            other => panic!("expected queue message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_frame_is_published_to_the_status_topic() {
        let config = DispatcherConfig {
            status_interval: Duration::from_millis(20),
            ..DispatcherConfig::default()
        };
        let status_destination = config.status_destination.clone();
        let tx = spawn_dispatcher(config);
        let (conn, mut rx) = connect(1);
        let sub = sub_ref(&conn, "status-sub", &status_destination);
        tx.send(Request::Connected { conn }).await.expect("send");
        tx.send(Request::Subscribe { sub, receipt: None })
            .await
            .expect("send");

        match recv(&mut rx).await {
            Delivery::TopicMessage { frame, .. } => {
                assert_eq!(frame.destination(), Some(status_destination.as_str()));
                assert_eq!(
                    frame.headers.get(header::CONTENT_TYPE),
                    Some("application/json")
                );
                let body: serde_json::Value =
                    serde_json::from_slice(&frame.body).expect("status json");
                assert_eq!(body["type"], "status");
                assert_eq!(body["subsystem"], "processor");
                assert_eq!(body["connectCount"], 1);
            }
            other => panic!("expected topic message, got {other:?}"),
        }
    }
}
