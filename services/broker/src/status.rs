// Process identity injected into the dispatcher for status frames.
use chrono::Utc;
use stampede_core::StatusSource;

use crate::config::BrokerConfig;

/// Answers the dispatcher's identity questions from the running process.
#[derive(Debug)]
pub struct ProcessStatusSource {
    id: String,
    name: String,
    version: String,
}

impl ProcessStatusSource {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            id: config.server_id.clone(),
            name: config.server_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl StatusSource for ProcessStatusSource {
    fn server_id(&self) -> String {
        self.id.clone()
    }

    fn server_name(&self) -> String {
        self.name.clone()
    }

    fn server_version(&self) -> String {
        self.version.clone()
    }

    fn hostname(&self) -> String {
        whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string())
    }

    fn username(&self) -> String {
        whoami::username()
    }

    fn process_name(&self) -> String {
        std::env::args().next().unwrap_or_default()
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn timestamp_utc(&self) -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
    }
}
