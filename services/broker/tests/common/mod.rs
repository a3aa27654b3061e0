// Shared helpers: boot a broker on an ephemeral port and drive raw STOMP.
// Each test binary uses its own subset of these.
#![allow(dead_code)]
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use broker::auth::{AllowAll, Authenticator};
use broker::config::BrokerConfig;
use broker::status::ProcessStatusSource;
use broker::transport;
use bytes::Bytes;
use stampede_core::{Dispatcher, DispatcherConfig};
use stampede_storage::MemoryStore;
use stampede_wire::codec::{FrameReader, FrameWriter, ReadEvent};
use stampede_wire::{Frame, Version, command, header};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        bind: "127.0.0.1:0".parse().expect("addr"),
        metrics_bind: "127.0.0.1:0".parse().expect("addr"),
        auth_path: None,
        queue_prefix: "/queue/".to_string(),
        status_interval_ms: 5000,
        request_queue_depth: 128,
        delivery_queue_depth: 64,
        max_frame_bytes: 1024 * 1024,
        heartbeat_send_floor_ms: 100,
        heartbeat_recv_floor_ms: 100,
        heartbeat_tolerance: 1.5,
        server_name: "stampede".to_string(),
        server_id: "stampede-test".to_string(),
    }
}

pub async fn spawn_broker() -> SocketAddr {
    spawn_broker_with(test_config(), Arc::new(AllowAll)).await
}

pub async fn spawn_broker_with(config: BrokerConfig, auth: Arc<dyn Authenticator>) -> SocketAddr {
    let listener = TcpListener::bind(config.bind).await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let dispatcher_config = DispatcherConfig {
        queue_prefix: config.queue_prefix.clone(),
        status_destination: config.status_destination(),
        status_interval: Duration::from_millis(config.status_interval_ms),
        request_queue_depth: config.request_queue_depth,
    };
    let dispatcher = Dispatcher::new(
        dispatcher_config,
        Arc::new(MemoryStore::new()),
        Box::new(ProcessStatusSource::new(&config)),
    );
    let (requests_tx, requests_rx) = mpsc::channel(config.request_queue_depth);
    tokio::spawn(dispatcher.run(requests_rx));
    tokio::spawn(async move {
        let _ = transport::tcp::serve(listener, config, auth, requests_tx).await;
    });
    addr
}

pub struct StompClient {
    reader: FrameReader<BufReader<OwnedReadHalf>>,
    writer: FrameWriter<BufWriter<OwnedWriteHalf>>,
}

impl StompClient {
    /// Open a socket without performing the handshake.
    pub async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(BufReader::new(read_half), 1024 * 1024),
            writer: FrameWriter::new(BufWriter::new(write_half)),
        }
    }

    /// CONNECT and return the server's reply (CONNECTED or ERROR).
    pub async fn handshake(addr: SocketAddr, headers: &[(&str, &str)]) -> (Self, Frame) {
        let mut client = Self::open(addr).await;
        let mut connect = Frame::new(command::CONNECT);
        connect.headers.push(header::ACCEPT_VERSION, "1.2");
        connect.headers.push(header::HOST, "localhost");
        for (name, value) in headers {
            client_header(&mut connect, name, value);
        }
        client.write(&connect).await;
        let reply = client.expect_frame().await;
        if reply.command == command::CONNECTED {
            client.reader.set_version(Version::V1_2);
            client.writer.set_version(Version::V1_2);
        }
        (client, reply)
    }

    /// CONNECT expecting success.
    pub async fn connect(addr: SocketAddr) -> Self {
        let (client, reply) = Self::handshake(addr, &[]).await;
        assert_eq!(reply.command, command::CONNECTED, "handshake reply: {reply:?}");
        client
    }

    pub async fn write(&mut self, frame: &Frame) {
        self.writer.write_frame(frame).await.expect("write frame");
    }

    pub async fn write_heartbeat(&mut self) {
        self.writer.write_heartbeat().await.expect("write heartbeat");
    }

    pub async fn subscribe(&mut self, destination: &str, id: &str, ack: &str) {
        let mut frame = Frame::new(command::SUBSCRIBE);
        frame.headers.push(header::DESTINATION, destination);
        frame.headers.push(header::ID, id);
        frame.headers.push(header::ACK, ack);
        self.write(&frame).await;
    }

    /// Subscribe and wait for the receipt, making the subscription observable
    /// before returning. Only valid when the destination has no backlog: a
    /// stored frame would be delivered ahead of the receipt.
    pub async fn subscribe_confirmed(&mut self, destination: &str, id: &str, ack: &str) {
        let mut frame = Frame::new(command::SUBSCRIBE);
        frame.headers.push(header::DESTINATION, destination);
        frame.headers.push(header::ID, id);
        frame.headers.push(header::ACK, ack);
        frame.headers.push(header::RECEIPT, format!("sub-{id}"));
        self.write(&frame).await;
        let receipt = self.expect_frame().await;
        assert_eq!(receipt.command, command::RECEIPT);
    }

    pub async fn send(&mut self, destination: &str, body: &'static [u8]) {
        let mut frame = Frame::with_body(command::SEND, Bytes::from_static(body));
        frame.headers.push(header::DESTINATION, destination);
        self.write(&frame).await;
    }

    pub async fn ack(&mut self, id: &str) {
        let mut frame = Frame::new(command::ACK);
        frame.headers.push(header::ID, id);
        self.write(&frame).await;
    }

    pub async fn nack(&mut self, id: &str) {
        let mut frame = Frame::new(command::NACK);
        frame.headers.push(header::ID, id);
        self.write(&frame).await;
    }

    /// Next frame, skipping heartbeats. Panics after five seconds.
    pub async fn expect_frame(&mut self) -> Frame {
        loop {
            let event = timeout(IO_TIMEOUT, self.reader.read_event())
                .await
                .expect("frame timeout")
                .expect("read event");
            match event {
                Some(ReadEvent::Frame(frame)) => return frame,
                Some(ReadEvent::Heartbeat) => continue,
                None => panic!("connection closed while expecting a frame"),
            }
        }
    }

    /// Next wire event including heartbeats, or `None` on EOF.
    pub async fn next_event(&mut self) -> Option<ReadEvent> {
        timeout(IO_TIMEOUT, self.reader.read_event())
            .await
            .expect("event timeout")
            .expect("read event")
    }

    /// Wait for the peer to close the stream.
    pub async fn expect_eof(&mut self) {
        loop {
            match timeout(IO_TIMEOUT, self.reader.read_event())
                .await
                .expect("eof timeout")
            {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                // A reset counts as closed too.
                Err(_) => return,
            }
        }
    }
}

fn client_header(frame: &mut Frame, name: &str, value: &str) {
    frame.headers.set(name, value);
}
