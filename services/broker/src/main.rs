// Broker service main entry point.
use anyhow::{Context, Result};
use broker::auth::{AllowAll, Authenticator, FileAuth};
use broker::config::BrokerConfig;
use broker::observability;
use broker::status::ProcessStatusSource;
use broker::transport;
use stampede_core::{Dispatcher, DispatcherConfig};
use stampede_storage::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();
    let config = BrokerConfig::from_env_or_yaml().context("load broker config")?;

    let auth: Arc<dyn Authenticator> = match &config.auth_path {
        Some(path) => Arc::new(FileAuth::load(path).context("load credential file")?),
        None => Arc::new(AllowAll),
    };

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
    tracing::info!(server_id = %config.server_id, "dispatcher started");

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let listener = TcpListener::bind(config.bind)
        .await
        .context("bind STOMP listener")?;
    tracing::info!(addr = %listener.local_addr()?, "stomp listener started");
    let accept_task = {
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = transport::tcp::serve(listener, config, auth, requests_tx).await {
                tracing::warn!(error = %err, "accept loop exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    accept_task.abort();
    tracing::info!("broker stopped");
    Ok(())
}
