// Per-connection STOMP session: connecting -> connected -> closing.
//
// This module implements the protocol side of a client connection. The
// structure is three tasks per client:
//   1) a reader task that parses frames off the socket and forwards events,
//   2) the session loop below, which owns all per-connection protocol state
//      (subscriptions, ack watermarks, pending frames) and talks to the
//      dispatcher exclusively through `Request` messages,
//   3) a writer task (see writer.rs) that serializes every socket write.
//
// Queue acknowledgement model: the dispatcher removes a subscription from
// its queue's waiting list when it hands a frame over; the session re-arms it
// by emitting a fresh `Request::Subscribe` once the client acks (immediately,
// in auto mode). A NACK or a teardown with an unacked frame turns into
// `Request::Requeue`, which front-inserts the frame for the next subscriber.
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

use stampede_core::{
    AckMode, ConnectionHandle, ConnectionInfo, Delivery, Request, SubscriptionRef,
};
use stampede_wire::codec::{FrameReader, FrameWriter, ReadEvent};
use stampede_wire::{Frame, Version, WireError, command, header};

use super::writer::run_writer;
use crate::auth::Authenticator;
use crate::config::BrokerConfig;

// How long a client may sit on an open socket without completing CONNECT.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn handle_connection(
    conn_id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    config: BrokerConfig,
    auth: Arc<dyn Authenticator>,
    requests: mpsc::Sender<Request>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(BufReader::new(read_half), config.max_frame_bytes);
    let mut writer = FrameWriter::new(BufWriter::new(write_half));

    let Some(handshake) = negotiate(conn_id, &mut reader, &mut writer, &config, auth.as_ref()).await?
    else {
        // Rejected; an ERROR frame is already on the wire.
        return Ok(());
    };
    reader.set_version(handshake.version);
    writer.set_version(handshake.version);
    tracing::info!(
        conn_id,
        peer = %peer,
        version = %handshake.version,
        login = %handshake.login,
        "client connected"
    );

    let (delivery_tx, delivery_rx) = mpsc::channel::<Delivery>(config.delivery_queue_depth);
    let (wire_tx, wire_rx) = mpsc::channel::<Frame>(config.delivery_queue_depth);

    let handle = ConnectionHandle {
        id: conn_id,
        deliveries: delivery_tx.clone(),
        info: ConnectionInfo {
            address: peer.to_string(),
            login: handshake.login.clone(),
            connected_at: Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        },
    };
    if requests.send(Request::Connected { conn: handle }).await.is_err() {
        anyhow::bail!("dispatcher unavailable");
    }

    let writer_task = tokio::spawn(run_writer(writer, wire_rx, handshake.send_interval));

    // Reader task: frame parsing is not cancellation safe, so it runs apart
    // from the session loop and forwards events over a channel.
    let (read_tx, read_rx) = mpsc::channel::<std::result::Result<ReadEvent, WireError>>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            match reader.read_event().await {
                Ok(Some(event)) => {
                    if read_tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = read_tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });

    let mut session = Session {
        conn_id,
        requests: requests.clone(),
        deliveries: delivery_tx,
        wire: wire_tx,
        subscriptions: HashMap::new(),
        next_message_id: 0,
    };
    session.run(read_rx, delivery_rx, handshake.expect_interval).await;

    // Closing: unacked queue frames go back to their queues before the
    // dispatcher is told the connection is gone.
    session.teardown().await;
    reader_task.abort();
    drop(session); // closes the wire channel; the writer drains and exits
    let _ = writer_task.await;
    tracing::info!(conn_id, "client disconnected");
    Ok(())
}

struct Handshake {
    version: Version,
    login: String,
    /// Cadence of server heartbeats, when negotiated.
    send_interval: Option<Duration>,
    /// How long inbound silence is tolerated (negotiated interval x tolerance).
    expect_interval: Option<Duration>,
}

async fn negotiate(
    conn_id: u64,
    reader: &mut FrameReader<BufReader<OwnedReadHalf>>,
    writer: &mut FrameWriter<BufWriter<OwnedWriteHalf>>,
    config: &BrokerConfig,
    auth: &dyn Authenticator,
) -> Result<Option<Handshake>> {
    let frame = match timeout(CONNECT_TIMEOUT, reader.read_event()).await {
        Err(_) => return reject(writer, "CONNECT timed out").await,
        Ok(Ok(Some(ReadEvent::Frame(frame)))) => frame,
        Ok(Ok(Some(ReadEvent::Heartbeat))) => {
            return reject(writer, "expected CONNECT or STOMP frame").await;
        }
        Ok(Ok(None)) => return Ok(None),
        Ok(Err(err)) => return reject(writer, &format!("protocol error: {err}")).await,
    };
    if frame.command != command::CONNECT && frame.command != command::STOMP {
        return reject(writer, "expected CONNECT or STOMP frame").await;
    }

    // A missing accept-version header means a 1.0 client.
    let version = match frame.headers.get(header::ACCEPT_VERSION) {
        None => Version::V1_0,
        Some(list) => match list.split(',').filter_map(Version::parse).max() {
            Some(version) => version,
            None => {
                return reject(writer, "supported protocol versions are 1.0, 1.1, 1.2").await;
            }
        },
    };

    let login = frame.headers.get(header::LOGIN).unwrap_or("").to_string();
    let passcode = frame.headers.get(header::PASSCODE).unwrap_or("");
    if !auth.authenticate(&login, passcode) {
        tracing::info!(conn_id, login = %login, "authentication failed");
        metrics::counter!("stampede_auth_failures_total").increment(1);
        return reject(writer, "authentication failed").await;
    }

    // The client's pair reads (wanted-from-server, promised-inbound); each
    // side is either disabled or raised to the configured floor.
    let (sx, sy) = match frame.headers.get(header::HEART_BEAT) {
        None => (0, 0),
        Some(raw) => match parse_heart_beat(raw) {
            Some((wanted, promised)) => (
                negotiate_interval(wanted, config.heartbeat_send_floor_ms),
                negotiate_interval(promised, config.heartbeat_recv_floor_ms),
            ),
            None => return reject(writer, "malformed heart-beat header").await,
        },
    };

    let mut connected = Frame::new(command::CONNECTED);
    connected.headers.push(header::VERSION, version.as_str());
    connected
        .headers
        .push(header::SESSION, format!("session-{conn_id}"));
    connected.headers.push(
        header::SERVER,
        format!("{}/{}", config.server_name, env!("CARGO_PKG_VERSION")),
    );
    connected
        .headers
        .push(header::HEART_BEAT, format!("{sx},{sy}"));
    writer.write_frame(&connected).await?;

    let expect_ms = (sy as f64 * config.heartbeat_tolerance) as u64;
    Ok(Some(Handshake {
        version,
        login,
        send_interval: (sx > 0).then(|| Duration::from_millis(sx)),
        expect_interval: (sy > 0).then(|| Duration::from_millis(expect_ms)),
    }))
}

async fn reject(
    writer: &mut FrameWriter<BufWriter<OwnedWriteHalf>>,
    message: &str,
) -> Result<Option<Handshake>> {
    let _ = writer.write_frame(&Frame::error(message)).await;
    let _ = writer.shutdown().await;
    Ok(None)
}

fn negotiate_interval(client_ms: u64, floor_ms: u64) -> u64 {
    if client_ms == 0 { 0 } else { client_ms.max(floor_ms) }
}

fn parse_heart_beat(raw: &str) -> Option<(u64, u64)> {
    let (a, b) = raw.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// Client-side subscription state, owned by the session task alone.
struct Subscription {
    id: String,
    destination: String,
    ack: AckMode,
    // Watermark: message-id of the last frame sent on this subscription.
    last_message_id: u64,
    // At most one queue frame awaiting acknowledgement.
    pending: Option<Frame>,
}

enum Flow {
    Continue,
    Close,
}

struct Session {
    conn_id: u64,
    requests: mpsc::Sender<Request>,
    deliveries: mpsc::Sender<Delivery>,
    wire: mpsc::Sender<Frame>,
    subscriptions: HashMap<String, Subscription>,
    next_message_id: u64,
}

impl Session {
    async fn run(
        &mut self,
        mut read_rx: mpsc::Receiver<std::result::Result<ReadEvent, WireError>>,
        mut delivery_rx: mpsc::Receiver<Delivery>,
        expect_interval: Option<Duration>,
    ) {
        let mut read_deadline = expect_interval.map(|interval| Instant::now() + interval);
        loop {
            // Capture a copy of the deadline so the arm bodies can move it.
            let armed_deadline = read_deadline;
            let inbound_timeout = async move {
                match armed_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                event = read_rx.recv() => match event {
                    Some(Ok(ReadEvent::Frame(frame))) => {
                        if let Some(interval) = expect_interval {
                            read_deadline = Some(Instant::now() + interval);
                        }
                        metrics::counter!("stampede_frames_in_total").increment(1);
                        match self.handle_frame(frame).await {
                            Flow::Continue => {}
                            Flow::Close => break,
                        }
                    }
                    Some(Ok(ReadEvent::Heartbeat)) => {
                        if let Some(interval) = expect_interval {
                            read_deadline = Some(Instant::now() + interval);
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!(conn_id = self.conn_id, error = %err, "frame read failed");
                        self.send_error(&format!("protocol error: {err}")).await;
                        break;
                    }
                    None => break, // client closed the socket
                },
                delivery = delivery_rx.recv() => match delivery {
                    Some(delivery) => self.handle_delivery(delivery).await,
                    None => break,
                },
                _ = inbound_timeout => {
                    tracing::info!(conn_id = self.conn_id, "heart-beat timeout");
                    metrics::counter!("stampede_heartbeat_timeouts_total").increment(1);
                    self.send_error("heart-beat timeout").await;
                    break;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Flow {
        match frame.command.as_str() {
            command::SEND => self.handle_send(frame).await,
            command::SUBSCRIBE => self.handle_subscribe(frame).await,
            command::UNSUBSCRIBE => self.handle_unsubscribe(frame).await,
            command::ACK => self.handle_ack(frame, true).await,
            command::NACK => self.handle_ack(frame, false).await,
            command::BEGIN | command::COMMIT | command::ABORT => {
                // Accepted no-ops: the broker does not provide transactional
                // atomicity.
                self.answer_receipt(&frame).await;
                Flow::Continue
            }
            command::DISCONNECT => {
                self.answer_receipt(&frame).await;
                Flow::Close
            }
            other => {
                self.send_error(&format!("unexpected frame: {other}")).await;
                Flow::Close
            }
        }
    }

    async fn handle_send(&mut self, frame: Frame) -> Flow {
        if frame.destination().is_none() {
            self.send_error("SEND requires a destination header").await;
            return Flow::Close;
        }
        let receipt = frame.receipt().map(str::to_string);
        let message = to_message(frame);
        if self
            .requests
            .send(Request::Enqueue {
                conn_id: self.conn_id,
                frame: message,
                receipt,
            })
            .await
            .is_err()
        {
            return Flow::Close;
        }
        Flow::Continue
    }

    async fn handle_subscribe(&mut self, frame: Frame) -> Flow {
        let Some(destination) = frame.destination().map(str::to_string) else {
            self.send_error("SUBSCRIBE requires a destination header").await;
            return Flow::Close;
        };
        let Some(id) = frame.headers.get(header::ID).map(str::to_string) else {
            self.send_error("SUBSCRIBE requires an id header").await;
            return Flow::Close;
        };
        if self.subscriptions.contains_key(&id) {
            self.send_error(&format!("subscription id already in use: {id}"))
                .await;
            return Flow::Close;
        }
        let Some(ack) = AckMode::parse(frame.headers.get(header::ACK)) else {
            self.send_error("invalid ack header").await;
            return Flow::Close;
        };
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                destination: destination.clone(),
                ack,
                last_message_id: 0,
                pending: None,
            },
        );
        let sub = SubscriptionRef {
            conn_id: self.conn_id,
            sub_id: id,
            destination,
            ack,
            deliveries: self.deliveries.clone(),
        };
        let receipt = frame.receipt().map(str::to_string);
        if self
            .requests
            .send(Request::Subscribe { sub, receipt })
            .await
            .is_err()
        {
            return Flow::Close;
        }
        Flow::Continue
    }

    async fn handle_unsubscribe(&mut self, frame: Frame) -> Flow {
        let Some(id) = frame.headers.get(header::ID).map(str::to_string) else {
            self.send_error("UNSUBSCRIBE requires an id header").await;
            return Flow::Close;
        };
        let Some(mut sub) = self.subscriptions.remove(&id) else {
            self.send_error(&format!("unknown subscription id: {id}")).await;
            return Flow::Close;
        };
        // An unacked frame must not be lost with its subscription.
        if let Some(pending) = sub.pending.take()
            && !self.requeue(pending).await
        {
            return Flow::Close;
        }
        let receipt = frame.receipt().map(str::to_string);
        if self
            .requests
            .send(Request::Unsubscribe {
                conn_id: self.conn_id,
                sub_id: sub.id,
                destination: sub.destination,
                receipt,
            })
            .await
            .is_err()
        {
            return Flow::Close;
        }
        Flow::Continue
    }

    async fn handle_ack(&mut self, frame: Frame, is_ack: bool) -> Flow {
        let raw_id = frame
            .headers
            .get(header::ID)
            .or_else(|| frame.headers.get(header::MESSAGE_ID));
        let Some(raw_id) = raw_id else {
            self.send_error("ACK requires an id or message-id header").await;
            return Flow::Close;
        };
        let Ok(msg_id) = raw_id.trim().parse::<u64>() else {
            self.send_error(&format!("malformed ack id: {raw_id}")).await;
            return Flow::Close;
        };

        let conn_id = self.conn_id;
        let mut resubscribe = Vec::new();
        let mut requeue = Vec::new();
        for sub in self.subscriptions.values_mut() {
            if sub.pending.is_none() {
                continue;
            }
            let matched = if is_ack {
                sub.ack.is_acked_by(sub.last_message_id, msg_id)
            } else {
                sub.ack.is_nacked_by(sub.last_message_id, msg_id)
            };
            if !matched {
                continue;
            }
            let Some(pending) = sub.pending.take() else {
                continue;
            };
            if !is_ack {
                requeue.push(pending);
            }
            resubscribe.push(SubscriptionRef {
                conn_id,
                sub_id: sub.id.clone(),
                destination: sub.destination.clone(),
                ack: sub.ack,
                deliveries: self.deliveries.clone(),
            });
        }
        for frame in requeue {
            if !self.requeue(frame).await {
                return Flow::Close;
            }
        }
        for sub in resubscribe {
            if self
                .requests
                .send(Request::Subscribe { sub, receipt: None })
                .await
                .is_err()
            {
                return Flow::Close;
            }
        }
        self.answer_receipt(&frame).await;
        Flow::Continue
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::QueueMessage { sub_id, frame } => {
                let conn_id = self.conn_id;
                let next_id = self.next_message_id + 1;
                match self.subscriptions.get_mut(&sub_id) {
                    None => {
                        // Raced an unsubscribe; the frame goes back to its queue.
                        let mut frame = frame;
                        strip_delivery_stamps(&mut frame);
                        let _ = self.requests.send(Request::Requeue { frame }).await;
                    }
                    Some(sub) if sub.pending.is_some() => {
                        tracing::warn!(
                            conn_id,
                            sub_id = %sub_id,
                            "delivery for a subscription with a pending frame"
                        );
                        let mut frame = frame;
                        strip_delivery_stamps(&mut frame);
                        let _ = self.requests.send(Request::Requeue { frame }).await;
                    }
                    Some(sub) => {
                        self.next_message_id = next_id;
                        let mut frame = frame;
                        frame.headers.set(header::SUBSCRIPTION, sub.id.clone());
                        frame.headers.set(header::MESSAGE_ID, next_id.to_string());
                        frame.headers.set(header::ACK, next_id.to_string());
                        sub.last_message_id = next_id;
                        if sub.ack == AckMode::Auto {
                            // Acked by definition once handed to the writer;
                            // the subscription re-arms immediately.
                            let resub = SubscriptionRef {
                                conn_id,
                                sub_id: sub.id.clone(),
                                destination: sub.destination.clone(),
                                ack: sub.ack,
                                deliveries: self.deliveries.clone(),
                            };
                            let _ = self.wire.send(frame).await;
                            let _ = self
                                .requests
                                .send(Request::Subscribe {
                                    sub: resub,
                                    receipt: None,
                                })
                                .await;
                        } else {
                            sub.pending = Some(frame.clone());
                            let _ = self.wire.send(frame).await;
                        }
                    }
                }
            }
            Delivery::TopicMessage { sub_id, frame } => {
                if !self.subscriptions.contains_key(&sub_id) {
                    // Raced an unsubscribe; topic frames are best-effort.
                    return;
                }
                self.next_message_id += 1;
                let mut frame = frame;
                frame.headers.set(header::SUBSCRIPTION, sub_id);
                frame
                    .headers
                    .set(header::MESSAGE_ID, self.next_message_id.to_string());
                let _ = self.wire.send(frame).await;
            }
            Delivery::Server(frame) => {
                let _ = self.wire.send(frame).await;
            }
        }
    }

    /// Strip per-subscription stamps and hand the frame back to its queue.
    /// Returns false when the dispatcher is gone.
    async fn requeue(&mut self, mut frame: Frame) -> bool {
        strip_delivery_stamps(&mut frame);
        self.requests
            .send(Request::Requeue { frame })
            .await
            .is_ok()
    }

    async fn teardown(&mut self) {
        let mut pending = Vec::new();
        for sub in self.subscriptions.values_mut() {
            if let Some(frame) = sub.pending.take() {
                pending.push(frame);
            }
        }
        for frame in pending {
            self.requeue(frame).await;
        }
        let _ = self
            .requests
            .send(Request::Disconnected {
                conn_id: self.conn_id,
            })
            .await;
    }

    async fn answer_receipt(&mut self, frame: &Frame) {
        if let Some(receipt_id) = frame.receipt() {
            let _ = self.wire.send(Frame::receipt_for(receipt_id)).await;
        }
    }

    async fn send_error(&mut self, message: &str) {
        let _ = self.wire.send(Frame::error(message)).await;
    }
}

/// Rewrite a client SEND into the MESSAGE frame subscribers receive.
fn to_message(mut frame: Frame) -> Frame {
    frame.command = command::MESSAGE.to_string();
    frame.headers.remove(header::RECEIPT);
    frame.headers.remove(header::TRANSACTION);
    frame
}

fn strip_delivery_stamps(frame: &mut Frame) {
    frame.headers.remove(header::SUBSCRIPTION);
    frame.headers.remove(header::MESSAGE_ID);
    frame.headers.remove(header::ACK);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heart_beat_negotiation_applies_floor_and_zero() {
        assert_eq!(negotiate_interval(0, 500), 0);
        assert_eq!(negotiate_interval(100, 500), 500);
        assert_eq!(negotiate_interval(2000, 500), 2000);
    }

    #[test]
    fn heart_beat_header_parsing() {
        assert_eq!(parse_heart_beat("0,1000"), Some((0, 1000)));
        assert_eq!(parse_heart_beat(" 10 , 20 "), Some((10, 20)));
        assert_eq!(parse_heart_beat("1000"), None);
        assert_eq!(parse_heart_beat("a,b"), None);
    }

    #[test]
    fn send_becomes_message_without_receipt_or_transaction() {
        let mut frame = Frame::new(command::SEND);
        frame.headers.push(header::DESTINATION, "/queue/x");
        frame.headers.push(header::RECEIPT, "r1");
        frame.headers.push(header::TRANSACTION, "t1");
        let message = to_message(frame);
        assert_eq!(message.command, command::MESSAGE);
        assert_eq!(message.destination(), Some("/queue/x"));
        assert!(!message.headers.contains(header::RECEIPT));
        assert!(!message.headers.contains(header::TRANSACTION));
    }

    #[test]
    fn stamps_are_stripped_before_requeue() {
        let mut frame = Frame::new(command::MESSAGE);
        frame.headers.push(header::DESTINATION, "/queue/x");
        frame.headers.push(header::SUBSCRIPTION, "s1");
        frame.headers.push(header::MESSAGE_ID, "4");
        frame.headers.push(header::ACK, "4");
        strip_delivery_stamps(&mut frame);
        assert_eq!(frame.headers.len(), 1);
        assert_eq!(frame.destination(), Some("/queue/x"));
    }
}
