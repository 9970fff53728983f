//! Configuration management for the RideSync driver console

use ridesync_core::{ClientConfig, Coordinates, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub location: LocationConfig,
    pub presence_interval_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: Option<u32>,
}

/// Position reported while online; the console has no GPS of its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "localhost".to_string(),
                port: 3000,
                use_tls: false,
            },
            reconnect: ReconnectConfig {
                initial_delay_ms: 500,
                max_delay_ms: 30_000,
                max_attempts: None,
            },
            location: LocationConfig {
                latitude: 6.5244,
                longitude: 3.3792,
            },
            presence_interval_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl AppConfig {
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, data_dir: &Path) -> anyhow::Result<()> {
        let config_path = data_dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&self.server.host, self.server.port, self.server.use_tls);
        config.presence_interval = Duration::from_secs(self.presence_interval_secs.max(1));
        config.request_timeout = Duration::from_secs(self.request_timeout_secs.max(1));
        config.reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        };
        config
    }

    pub fn fallback_location(&self) -> Coordinates {
        Coordinates::new(self.location.latitude, self.location.longitude)
    }
}
