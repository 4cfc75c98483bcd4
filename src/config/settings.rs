use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Upstream push-connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket URL of the tournament backend
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Initial reconnect delay in milliseconds (transport tier)
    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay_ms: u64,
    /// Maximum reconnect delay in milliseconds (transport tier)
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
    /// Handshake attempts per transport retry cycle
    #[serde(default = "default_transport_retry_attempts")]
    pub transport_retry_attempts: u32,
    /// Exhausted transport cycles before falling back to polling
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Idle window in seconds before the watchdog forces a reconnect
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Watchdog check interval in seconds
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,
    /// Pull cadence in seconds while in polling fallback
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
}

fn default_upstream_url() -> String {
    "ws://localhost:3001/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_reconnect_initial_delay() -> u64 {
    1000 // 1 second
}

fn default_reconnect_max_delay() -> u64 {
    5000 // 5 seconds
}

fn default_transport_retry_attempts() -> u32 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_idle_check_interval() -> u64 {
    30
}

fn default_polling_interval() -> u64 {
    10
}

/// REST backend used for scoped snapshots and fallback polling.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "http://localhost:3001/api".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Buffer size of each attached consumer port
    #[serde(default = "default_port_buffer_size")]
    pub port_buffer_size: usize,
}

fn default_port_buffer_size() -> usize {
    32
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("upstream.url", default_upstream_url())?
            .set_default("upstream.connect_timeout_secs", 20)?
            .set_default("upstream.polling_interval_secs", 10)?
            .set_default("api.base_url", default_api_base_url())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // UPSTREAM_URL, API_BASE_URL, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            transport_retry_attempts: default_transport_retry_attempts(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            idle_timeout_secs: default_idle_timeout(),
            idle_check_interval_secs: default_idle_check_interval(),
            polling_interval_secs: default_polling_interval(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port_buffer_size: default_port_buffer_size(),
        }
    }
}
