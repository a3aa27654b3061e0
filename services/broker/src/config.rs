use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // STOMP listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Optional JSON credential file; absent means allow all.
    pub auth_path: Option<String>,
    // Destinations under this prefix are queues.
    pub queue_prefix: String,
    // Interval between status frames on the status topic.
    pub status_interval_ms: u64,
    // Bound of the dispatcher's inbound request channel.
    pub request_queue_depth: usize,
    // Bound of each connection's delivery channel.
    pub delivery_queue_depth: usize,
    // Max frame size accepted from a client.
    pub max_frame_bytes: usize,
    // Smallest heartbeat interval the server will agree to, per direction.
    pub heartbeat_send_floor_ms: u64,
    pub heartbeat_recv_floor_ms: u64,
    // Grace multiplier on the inbound heartbeat deadline; never below 1.5.
    pub heartbeat_tolerance: f64,
    // Name reported in the `server` header and status frames.
    pub server_name: String,
    // Identifier reported in status frames.
    pub server_id: String,
}

const DEFAULT_BROKER_CONFIG_PATH: &str = "/usr/local/stampede/config.yml";
const DEFAULT_STATUS_INTERVAL_MS: u64 = 5000;
const DEFAULT_REQUEST_QUEUE_DEPTH: usize = 128;
const DEFAULT_DELIVERY_QUEUE_DEPTH: usize = 64;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_HEARTBEAT_FLOOR_MS: u64 = 500;
const DEFAULT_HEARTBEAT_TOLERANCE: f64 = 1.5;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    auth_path: Option<String>,
    queue_prefix: Option<String>,
    status_interval_ms: Option<u64>,
    request_queue_depth: Option<usize>,
    delivery_queue_depth: Option<usize>,
    max_frame_bytes: Option<usize>,
    heartbeat_send_floor_ms: Option<u64>,
    heartbeat_recv_floor_ms: Option<u64>,
    heartbeat_tolerance: Option<f64>,
    server_name: Option<String>,
    server_id: Option<String>,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("STAMPEDE_BIND")
            .unwrap_or_else(|_| "0.0.0.0:61613".to_string())
            .parse()
            .with_context(|| "parse STAMPEDE_BIND")?;
        let metrics_bind = std::env::var("STAMPEDE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9109".to_string())
            .parse()
            .with_context(|| "parse STAMPEDE_METRICS_BIND")?;
        let auth_path = std::env::var("STAMPEDE_AUTH_FILE").ok();
        let queue_prefix =
            std::env::var("STAMPEDE_QUEUE_PREFIX").unwrap_or_else(|_| "/queue/".to_string());
        let status_interval_ms = std::env::var("STAMPEDE_STATUS_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STATUS_INTERVAL_MS);
        let request_queue_depth = std::env::var("STAMPEDE_REQUEST_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_REQUEST_QUEUE_DEPTH);
        let delivery_queue_depth = std::env::var("STAMPEDE_DELIVERY_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_DELIVERY_QUEUE_DEPTH);
        let max_frame_bytes = std::env::var("STAMPEDE_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let heartbeat_send_floor_ms = std::env::var("STAMPEDE_HEARTBEAT_SEND_FLOOR_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_FLOOR_MS);
        let heartbeat_recv_floor_ms = std::env::var("STAMPEDE_HEARTBEAT_RECV_FLOOR_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_FLOOR_MS);
        let heartbeat_tolerance = std::env::var("STAMPEDE_HEARTBEAT_TOLERANCE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_TOLERANCE)
            .max(DEFAULT_HEARTBEAT_TOLERANCE);
        let server_name =
            std::env::var("STAMPEDE_SERVER_NAME").unwrap_or_else(|_| "stampede".to_string());
        let server_id = std::env::var("STAMPEDE_SERVER_ID")
            .unwrap_or_else(|_| format!("stampede-{}", std::process::id()));
        Ok(Self {
            bind,
            metrics_bind,
            auth_path,
            queue_prefix,
            status_interval_ms,
            request_queue_depth,
            delivery_queue_depth,
            max_frame_bytes,
            heartbeat_send_floor_ms,
            heartbeat_recv_floor_ms,
            heartbeat_tolerance,
            server_name,
            server_id,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("STAMPEDE_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_BROKER_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if override_path.is_some() {
                    return Err(err).with_context(|| format!("read STAMPEDE_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read broker config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            // YAML overrides allow ops-friendly config files.
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            if let Some(value) = override_cfg.bind {
                config.bind = value.parse().with_context(|| "parse bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.auth_path {
                config.auth_path = Some(value);
            }
            if let Some(value) = override_cfg.queue_prefix {
                config.queue_prefix = value;
            }
            if let Some(value) = override_cfg.status_interval_ms
                && value > 0
            {
                config.status_interval_ms = value;
            }
            if let Some(value) = override_cfg.request_queue_depth
                && value > 0
            {
                config.request_queue_depth = value;
            }
            if let Some(value) = override_cfg.delivery_queue_depth
                && value > 0
            {
                config.delivery_queue_depth = value;
            }
            if let Some(value) = override_cfg.max_frame_bytes
                && value > 0
            {
                config.max_frame_bytes = value;
            }
            if let Some(value) = override_cfg.heartbeat_send_floor_ms
                && value > 0
            {
                config.heartbeat_send_floor_ms = value;
            }
            if let Some(value) = override_cfg.heartbeat_recv_floor_ms
                && value > 0
            {
                config.heartbeat_recv_floor_ms = value;
            }
            if let Some(value) = override_cfg.heartbeat_tolerance {
                config.heartbeat_tolerance = value.max(DEFAULT_HEARTBEAT_TOLERANCE);
            }
            if let Some(value) = override_cfg.server_name {
                config.server_name = value;
            }
            if let Some(value) = override_cfg.server_id {
                config.server_id = value;
            }
        }
        Ok(config)
    }

    /// Destination of the periodic status frame.
    pub fn status_destination(&self) -> String {
        format!("/topic/{}.status", self.server_name)
    }
}
