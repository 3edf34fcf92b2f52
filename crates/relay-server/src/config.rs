//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - The first TOML file found in the search path
//! - Environment variables (`RELAY_*`, `__` between sections, e.g.
//!   `RELAY_HEARTBEAT__INTERVAL_MS=5000`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tenvis_relay_transport::{ConnectionConfig, KeepaliveConfig};

/// Config file search path.
const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Lifetime of unanswered reply handlers in milliseconds; 0 disables expiry.
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Idle time before a ping, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// How long to wait for traffic after a ping, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    10_000
}

fn default_heartbeat_timeout() -> u64 {
    4_000
}

fn default_reply_timeout() -> u64 {
    30_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reply_timeout_ms: default_reply_timeout(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the first config file found and
    /// the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::layered(file.as_deref())
    }

    /// Load configuration from a specific file plus the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .with_context(|| format!("Config path is not valid UTF-8: {}", path.display()))?;
        Self::layered(Some(path))
    }

    fn layered(file: Option<&str>) -> Result<Self> {
        let defaults = toml::to_string(&Self::default()).context("Failed to serialize defaults")?;

        let mut builder = ::config::Config::builder()
            .add_source(::config::File::from_str(&defaults, ::config::FileFormat::Toml));
        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::new(path, ::config::FileFormat::Toml).required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .with_context(|| match file {
                Some(path) => format!("Failed to load config file: {path}"),
                None => "Failed to load configuration".to_string(),
            })
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Settings applied to every accepted connection.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            keepalive: KeepaliveConfig {
                ping_interval: Duration::from_millis(self.heartbeat.interval_ms),
                pong_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            },
            reply_timeout: (self.reply_timeout_ms > 0).then(|| Duration::from_millis(self.reply_timeout_ms)),
            max_message_size: self.limits.max_message_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.heartbeat.interval_ms, 10_000);
        assert_eq!(config.heartbeat.timeout_ms, 4_000);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            reply_timeout_ms = 0

            [limits]
            max_message_size = 1024
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_message_size, 1024);
        assert_eq!(config.heartbeat.interval_ms, 10_000);

        let conn = config.connection_config();
        assert_eq!(conn.reply_timeout, None);
        assert_eq!(conn.max_message_size, 1024);
        assert_eq!(conn.keepalive.pong_timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_config_from_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!("relay-config-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "port = 7070\n[heartbeat]\ninterval_ms = 2500").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7070);
        assert_eq!(config.heartbeat.interval_ms, 2500);
        assert_eq!(config.heartbeat.timeout_ms, 4_000);
        assert_eq!(config.transport.websocket_path, "/ws");
    }
}
