// Subscription handles and the dispatcher -> connection delivery protocol.
use stampede_wire::Frame;
use tokio::sync::mpsc;

/// Acknowledgement mode of a subscription, from the `ack` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    /// Parse the `ack` header value; absent means `auto`, anything else is a
    /// protocol error surfaced by the caller.
    pub fn parse(value: Option<&str>) -> Option<AckMode> {
        match value {
            None | Some("auto") => Some(AckMode::Auto),
            Some("client") => Some(AckMode::Client),
            Some("client-individual") => Some(AckMode::ClientIndividual),
            Some(_) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Does `msg_id` acknowledge a subscription whose last delivered id is
    /// `watermark`? `client` mode is cumulative, `client-individual` exact.
    pub fn is_acked_by(&self, watermark: u64, msg_id: u64) -> bool {
        match self {
            AckMode::Auto => true,
            AckMode::Client => msg_id >= watermark,
            AckMode::ClientIndividual => msg_id == watermark,
        }
    }

    /// NACK applies to the named message only, in every mode.
    pub fn is_nacked_by(&self, watermark: u64, msg_id: u64) -> bool {
        msg_id == watermark
    }
}

/// A frame pushed from the dispatcher to a connection task.
#[derive(Debug)]
pub enum Delivery {
    /// Queue frame; the connection stamps ids and tracks the acknowledgement.
    QueueMessage { sub_id: String, frame: Frame },
    /// Topic frame; stamped and written, never tracked.
    TopicMessage { sub_id: String, frame: Frame },
    /// Server-generated frame (RECEIPT, ERROR, ...) written as-is.
    Server(Frame),
}

/// Non-owning handle to a connection's subscription.
///
/// The connection task owns the mutable subscription state (ack watermark,
/// pending frame); the routing side only needs an address to deliver to. Two
/// handles are the same subscription iff `(conn_id, sub_id)` match.
#[derive(Debug, Clone)]
pub struct SubscriptionRef {
    pub conn_id: u64,
    pub sub_id: String,
    pub destination: String,
    pub ack: AckMode,
    pub deliveries: mpsc::Sender<Delivery>,
}

impl SubscriptionRef {
    pub fn is(&self, conn_id: u64, sub_id: &str) -> bool {
        self.conn_id == conn_id && self.sub_id == sub_id
    }
}

/// Registration record for a connection, kept in the dispatcher's table.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub deliveries: mpsc::Sender<Delivery>,
    pub info: ConnectionInfo,
}

/// Static facts about a connection, reported in status frames.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub address: String,
    pub login: String,
    pub connected_at: String,
}
