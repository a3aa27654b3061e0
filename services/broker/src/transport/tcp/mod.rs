//! TCP accept loop and per-connection task setup.
//!
//! # Purpose and responsibility
//! Accepts incoming STOMP connections and spawns a session task per client.
//! Each session owns its reader and hands all socket writes to a dedicated
//! writer task.
//!
//! # Key invariants and assumptions
//! - Connection ids are unique for the lifetime of the accept loop.
//! - The dispatcher request channel is the only path into routing state.
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use stampede_core::Request;

use crate::auth::Authenticator;
use crate::config::BrokerConfig;

pub(crate) mod conn;
mod writer;

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Serve incoming STOMP connections for the broker.
///
/// Runs the accept loop and spawns a task per connection. Accept errors are
/// retried with exponential backoff so a transient resource squeeze does not
/// kill the listener.
pub async fn serve(
    listener: TcpListener,
    config: BrokerConfig,
    auth: Arc<dyn Authenticator>,
    requests: mpsc::Sender<Request>,
) -> Result<()> {
    let mut next_conn_id: u64 = 0;
    let mut backoff = Duration::ZERO;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                backoff = Duration::ZERO;
                let conn_id = next_conn_id;
                next_conn_id += 1;
                metrics::counter!("stampede_connections_total").increment(1);
                let _ = stream.set_nodelay(true);
                let config = config.clone();
                let auth = Arc::clone(&auth);
                let requests = requests.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        conn::handle_connection(conn_id, stream, peer, config, auth, requests).await
                    {
                        tracing::warn!(conn_id, error = %err, "connection handler failed");
                    }
                });
            }
            Err(err) => {
                backoff = if backoff.is_zero() {
                    ACCEPT_BACKOFF_START
                } else {
                    (backoff * 2).min(ACCEPT_BACKOFF_MAX)
                };
                tracing::error!(error = %err, backoff_ms = backoff.as_millis() as u64, "accept failed, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
