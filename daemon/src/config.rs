//! Agent configuration

use anyhow::Result;
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use wsrelay_protocol::MAX_FRAME_SIZE;

/// Agent configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Socket session tuning
    #[serde(default)]
    pub session: SessionConfig,

    /// Hostname resolution
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl AgentConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load and merge configuration from file (incremental update)
    pub async fn load_merge(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let other = Self::load(path).await?;
        self.merge(other);
        Ok(())
    }

    /// Merge another config into this one
    ///
    /// Scalar values overwrite only when the new value differs from the default.
    pub fn merge(&mut self, other: AgentConfig) {
        // Server config
        if other.server.mode != TransportMode::default() {
            self.server.mode = other.server.mode;
        }
        if other.server.bind != default_bind() {
            self.server.bind = other.server.bind;
        }
        if other.server.max_connections != default_max_connections() {
            self.server.max_connections = other.server.max_connections;
        }
        if other.server.max_frame_size != default_max_frame_size() {
            self.server.max_frame_size = other.server.max_frame_size;
        }

        // Session config
        if other.session.recv_buffer_size != default_recv_buffer_size() {
            self.session.recv_buffer_size = other.session.recv_buffer_size;
        }
        if other.session.outbound_queue != default_outbound_queue() {
            self.session.outbound_queue = other.session.outbound_queue;
        }
        if other.session.write_queue != default_write_queue() {
            self.session.write_queue = other.session.write_queue;
        }

        // Resolver
        if other.resolver.timeout_ms != default_resolver_timeout() {
            self.resolver.timeout_ms = other.resolver.timeout_ms;
        }

        // Monitoring
        if other.monitoring.prometheus_enabled {
            self.monitoring.prometheus_enabled = true;
        }
        if other.monitoring.prometheus_bind != default_prometheus_bind() {
            self.monitoring.prometheus_bind = other.monitoring.prometheus_bind;
        }
    }
}

/// How frames are carried on an accepted connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// One binary WebSocket message per frame
    #[default]
    Websocket,
    /// Length-framed raw byte stream
    Stream,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::Websocket),
            "stream" | "pipe" => Ok(Self::Stream),
            other => Err(format!("unknown transport mode: {}", other)),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Websocket => f.write_str("websocket"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Transport mode
    #[serde(default)]
    pub mode: TransportMode,

    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Maximum concurrent controller connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Largest accepted frame, header included
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8700))
}

fn default_max_connections() -> usize {
    64
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            bind: default_bind(),
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Socket session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Per-read chunk size for TCP/UDP receive loops
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Bounded outbound frame queue per connection
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Bounded write queue per socket; a full queue fails the send
    #[serde(default = "default_write_queue")]
    pub write_queue: usize,
}

fn default_recv_buffer_size() -> usize {
    65000
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_write_queue() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: default_recv_buffer_size(),
            outbound_queue: default_outbound_queue(),
            write_queue: default_write_queue(),
        }
    }
}

/// Resolver configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Per-name timeout in milliseconds
    #[serde(default = "default_resolver_timeout")]
    pub timeout_ms: u64,
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_resolver_timeout() -> u64 {
    1000
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_resolver_timeout(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default)]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9700))
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: false,
        }
    }
}
