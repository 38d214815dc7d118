//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file given with `--config`
//! - `courier.toml`, `/etc/courier/courier.toml` or `~/.config/courier/courier.toml`
//! - Environment variables (`COURIER_HOST`, `COURIER_PORT`), applied last

use anyhow::{ensure, Context, Result};
use courier_core::SessionConfig;
use courier_protocol::{Gid, Uid};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the TCP listener.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Name this node announces to the cluster.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Session configuration.
    #[serde(default)]
    pub session: SessionSettings,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Admin HTTP endpoint.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Groups created at startup.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable the TCP listener.
    #[serde(default = "default_true")]
    pub tcp: bool,

    /// Enable the WebSocket listener.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Port of the WebSocket listener.
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,
}

/// Per-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Seconds of silence before a connection is dropped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
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

/// Admin endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Serve `/health` and `/stats`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Admin HTTP port.
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

/// A statically configured group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group id.
    pub id: Gid,

    /// Member uids.
    #[serde(default)]
    pub members: Vec<Uid>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    23000
}

fn default_node_id() -> String {
    "courier-1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_websocket_port() -> u16 {
    23080
}

fn default_idle_timeout() -> u64 {
    20
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_admin_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_id: default_node_id(),
            transport: TransportConfig::default(),
            session: SessionSettings::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
            admin: AdminConfig::default(),
            groups: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp: true,
            websocket: true,
            websocket_port: default_websocket_port(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
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

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_admin_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the first default location
    /// that exists, falling back to defaults. Environment overrides are
    /// applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_default_paths()?,
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.session.idle_timeout_secs > 0,
            "session.idle_timeout_secs must be at least 1"
        );
        ensure!(
            self.limits.max_connections > 0,
            "limits.max_connections must be at least 1"
        );
        Ok(())
    }

    fn from_default_paths() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("COURIER_HOST") {
            self.host = host;
        }
        if let Some(port) = std::env::var("COURIER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.port = port;
        }
    }

    /// Address of the TCP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not a valid IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.addr_with_port(self.port)
    }

    /// Address of the WebSocket listener.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not a valid IP address.
    pub fn websocket_addr(&self) -> Result<SocketAddr> {
        self.addr_with_port(self.transport.websocket_port)
    }

    /// Address of the admin HTTP endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not a valid IP address.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        self.addr_with_port(self.admin.port)
    }

    fn addr_with_port(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", self.host, port)
            .parse()
            .with_context(|| format!("Invalid host:port: {}:{}", self.host, port))
    }

    /// Settings handed to every session.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
        }
    }
}
