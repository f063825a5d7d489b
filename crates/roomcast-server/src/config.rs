//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - The first TOML file found (`--config`, `roomcast.toml`,
//!   `/etc/roomcast/roomcast.toml`, `~/.config/roomcast/roomcast.toml`)
//! - Environment variables (`ROOMCAST_*`, `__` between nested keys, e.g.
//!   `ROOMCAST_KEEPALIVE__PONG_WAIT_MS=5000`)
//! - Command line `--addr`

use anyhow::{bail, Context, Result};
use roomcast_core::bus::DEFAULT_BUS_CAPACITY;
use roomcast_core::{BridgeConfig, EndpointConfig, KeepAliveConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PATHS: [&str; 3] = [
    "roomcast.toml",
    "/etc/roomcast/roomcast.toml",
    "~/.config/roomcast/roomcast.toml",
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

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Liveness configuration.
    #[serde(default)]
    pub keepalive: KeepAliveSettings,

    /// Bus configuration.
    #[serde(default)]
    pub bus: BusSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// HTML file served at `/`. The bundled page is used when unset.
    #[serde(default)]
    pub home_page: Option<PathBuf>,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Frames buffered per connection before fan-out starts dropping.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Liveness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveSettings {
    /// Read deadline in milliseconds. Probes go out every 7/10 of this.
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,

    /// Write deadline in milliseconds.
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Topic shared by every room.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Publish timeout in milliseconds.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Extra publish attempts after a failure.
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,

    /// First re-subscribe delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,

    /// Maximum re-subscribe delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,

    /// Per-topic buffer of the in-process bus.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
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

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
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

fn default_max_frame_size() -> usize {
    roomcast_protocol::MAX_FRAME_SIZE
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_pong_wait_ms() -> u64 {
    10_000
}

fn default_write_wait_ms() -> u64 {
    10_000
}

fn default_topic() -> String {
    "chat".to_string()
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_publish_retries() -> u32 {
    1
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_bus_capacity() -> usize {
    DEFAULT_BUS_CAPACITY
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
            keepalive: KeepAliveSettings::default(),
            bus: BusSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            home_page: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait_ms(),
            write_wait_ms: default_write_wait_ms(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            publish_timeout_ms: default_publish_timeout_ms(),
            publish_retries: default_publish_retries(),
            reconnect_initial_backoff_ms: default_initial_backoff_ms(),
            reconnect_max_backoff_ms: default_max_backoff_ms(),
            capacity: default_bus_capacity(),
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
    /// Load configuration from the first config file found, then the environment.
    ///
    /// An explicit `path` must exist; the default locations are optional.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be parsed, an explicit path
    /// is missing, or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.exists() => {
                bail!("Config file not found: {}", path.display());
            }
            Some(path) => Some(path.to_path_buf()),
            None => DEFAULT_PATHS
                .iter()
                .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
                .find(|p| p.exists()),
        };

        Self::from_sources(file.as_deref(), environment())
    }

    fn from_sources(file: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder =
                builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }

        let config: Config = builder
            .add_source(env)
            .build()
            .and_then(|built| built.try_deserialize())
            .with_context(|| match file {
                Some(path) => format!("Failed to parse config file: {}", path.display()),
                None => "Failed to load configuration".to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check that the values can run a server.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_frame_size == 0 {
            bail!("limits.max_frame_size must be greater than zero");
        }
        if self.limits.outbound_queue_capacity == 0 {
            bail!("limits.outbound_queue_capacity must be greater than zero");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        if self.transport.websocket_path == "/" || self.transport.websocket_path == "/health" {
            bail!(
                "transport.websocket_path conflicts with a built-in route: {}",
                self.transport.websocket_path
            );
        }
        self.keepalive_config()
            .validate()
            .context("Invalid keepalive settings")?;
        if self.bus.reconnect_initial_backoff_ms > self.bus.reconnect_max_backoff_ms {
            bail!("bus.reconnect_initial_backoff_ms exceeds bus.reconnect_max_backoff_ms");
        }
        Ok(())
    }

    /// Override host and port from a listen address such as `:8080`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn apply_listen_addr(&mut self, addr: &str) -> Result<()> {
        let addr = parse_listen_addr(addr)?;
        self.host = addr.ip().to_string();
        self.port = addr.port();
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{}:{}", host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Liveness parameters for every connection.
    #[must_use]
    pub fn keepalive_config(&self) -> KeepAliveConfig {
        KeepAliveConfig::new(
            Duration::from_millis(self.keepalive.pong_wait_ms),
            Duration::from_millis(self.keepalive.write_wait_ms),
        )
    }

    /// Per-connection endpoint parameters.
    #[must_use]
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            keepalive: self.keepalive_config(),
            max_frame_size: self.limits.max_frame_size,
            outbound_capacity: self.limits.outbound_queue_capacity,
        }
    }

    /// Bus bridge parameters.
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            topic: self.bus.topic.clone(),
            publish_timeout: Duration::from_millis(self.bus.publish_timeout_ms),
            publish_retries: self.bus.publish_retries,
            reconnect_initial_backoff: Duration::from_millis(self.bus.reconnect_initial_backoff_ms),
            reconnect_max_backoff: Duration::from_millis(self.bus.reconnect_max_backoff_ms),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("ROOMCAST")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Parse a listen address. A bare `:port` listens on every interface.
///
/// # Errors
///
/// Returns an error if the address is not `ip:port` or `:port`.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("Invalid listen address: {}", addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_core::KeepAliveError;
    use std::collections::HashMap;

    fn env_from(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "roomcast-{}-{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert!(config.transport.home_page.is_none());
        assert_eq!(config.limits.max_frame_size, 512);
        assert_eq!(config.limits.outbound_queue_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "127.0.0.1"
            port = 9000

            [limits]
            outbound_queue_capacity = 64

            [keepalive]
            pong_wait_ms = 2000
            write_wait_ms = 3000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.outbound_queue_capacity, 64);
        assert_eq!(config.limits.max_frame_size, 512);

        let keepalive = config.keepalive_config();
        assert_eq!(keepalive.pong_wait, Duration::from_secs(2));
        assert_eq!(keepalive.ping_period(), Duration::from_millis(1400));
    }

    #[test]
    fn test_file_then_environment() {
        let path = write_temp(
            "layered",
            r#"
            port = 9100

            [bus]
            topic = "rooms"
            "#,
        );

        let config = Config::from_sources(
            Some(&path),
            env_from(&[
                ("ROOMCAST_PORT", "9200"),
                ("ROOMCAST_KEEPALIVE__PONG_WAIT_MS", "4000"),
            ]),
        )
        .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 9200);
        assert_eq!(config.bus.topic, "rooms");
        assert_eq!(config.keepalive.pong_wait_ms, 4000);
        assert_eq!(config.bridge_config().topic, "rooms");
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = Config::from_sources(None, env_from(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bus.topic, "chat");
        assert_eq!(config.bridge_config().publish_retries, 1);
    }

    #[test]
    fn test_missing_explicit_file() {
        let path = Path::new("/nonexistent/roomcast.toml");
        assert!(Config::load(Some(path)).is_err());
    }

    #[test]
    fn test_invalid_keepalive_rejected() {
        let mut config = Config::default();
        config.keepalive.write_wait_ms = 1000;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KeepAliveError>(),
            Some(KeepAliveError::WriteWaitTooShort { .. })
        ));

        config.keepalive = KeepAliveSettings::default();
        config.limits.outbound_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_listen_addr() {
        let addr = parse_listen_addr(":8080").unwrap();
        assert_eq!(addr, SocketAddr::from(([0, 0, 0, 0], 8080)));

        let addr = parse_listen_addr("127.0.0.1:9000").unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 9000)));

        assert!(parse_listen_addr("8080").is_err());
        assert!(parse_listen_addr("localhost").is_err());
    }

    #[test]
    fn test_apply_listen_addr() {
        let mut config = Config::default();
        config.apply_listen_addr("[::1]:7000").unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.bind_addr().unwrap(), "[::1]:7000".parse().unwrap());
    }

    #[test]
    fn test_endpoint_config() {
        let config = Config::default();
        let endpoint = config.endpoint_config();
        assert_eq!(endpoint.max_frame_size, 512);
        assert_eq!(endpoint.outbound_capacity, 256);
        assert_eq!(endpoint.keepalive, KeepAliveConfig::default());
    }
}
