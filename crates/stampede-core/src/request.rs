// The typed channel protocol from connection tasks into the dispatcher.
use stampede_wire::Frame;

use crate::subscription::{ConnectionHandle, SubscriptionRef};

/// One unit of work for the dispatcher, emitted by a connection task.
///
/// Receipts ride on the request so the dispatcher can answer them after the
/// server-visible effect has been applied.
#[derive(Debug)]
pub enum Request {
    /// A connection finished its handshake and joins the routing table.
    Connected { conn: ConnectionHandle },
    /// Add a subscription to its destination. Also used to re-arm a queue
    /// subscription after the connection observed an acknowledgement.
    Subscribe {
        sub: SubscriptionRef,
        receipt: Option<String>,
    },
    /// Drop a subscription from its destination.
    Unsubscribe {
        conn_id: u64,
        sub_id: String,
        destination: String,
        receipt: Option<String>,
    },
    /// Route a client SEND (already converted to a MESSAGE frame).
    Enqueue {
        conn_id: u64,
        frame: Frame,
        receipt: Option<String>,
    },
    /// Put a frame back at the head of its queue after a failed or refused
    /// delivery (NACK, teardown with an unacked frame).
    Requeue { frame: Frame },
    /// The connection is gone; purge it from every list and table.
    Disconnected { conn_id: u64 },
}
