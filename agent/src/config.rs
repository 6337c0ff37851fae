//! Agent configuration

use anyhow::Result;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Client-facing listener
    #[serde(default)]
    pub listen: ListenConfig,

    /// Upstream proxy link
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Shared credential and cipher selection
    #[serde(default)]
    pub security: SecurityConfig,

    /// Heartbeat and stale-link thresholds
    #[serde(default)]
    pub liveness: LivenessConfig,
}

impl AgentConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            upstream: UpstreamConfig::default(),
            security: SecurityConfig::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

/// Client-facing listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Bind address for SOCKS/HTTP clients
    #[serde(default = "default_listen_bind")]
    pub bind: SocketAddr,
}

fn default_listen_bind() -> SocketAddr {
    "127.0.0.1:10080".parse().expect("static address")
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: default_listen_bind(),
        }
    }
}

/// Upstream proxy link configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Proxy endpoint as host:port
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Dial timeout toward the proxy, and the client handshake deadline
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long to wait for the proxy to confirm the target connection
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "127.0.0.1:10081".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_confirm_timeout() -> u64 {
    20
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            connect_timeout_secs: default_connect_timeout(),
            confirm_timeout_secs: default_confirm_timeout(),
        }
    }
}

/// Shared credential and cipher selection
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Opaque shared token carried in every envelope
    #[serde(default = "default_token")]
    pub token: String,

    /// Passphrase the AES key is derived from
    #[serde(default = "default_passphrase")]
    pub passphrase: String,

    /// Cipher tag for sessions this agent originates
    /// ("plain", "base64", "aes", "aes-base64")
    #[serde(default = "default_cipher")]
    pub cipher: String,
}

fn default_token() -> String {
    "burrow-dev-token".to_string()
}

fn default_passphrase() -> String {
    "burrow-dev-passphrase".to_string()
}

fn default_cipher() -> String {
    "aes".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
            passphrase: default_passphrase(),
            cipher: default_cipher(),
        }
    }
}

/// Heartbeat and stale-link thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// Send-idle threshold before a heartbeat is emitted
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,

    /// Receive-idle expiry as a multiple of the idle threshold
    #[serde(default = "default_timeout_multiple")]
    pub timeout_multiple: u32,

    /// Grace deadline for draining in-flight writes on teardown
    #[serde(default = "default_grace_millis")]
    pub grace_millis: u64,
}

fn default_idle_secs() -> u64 {
    60
}

fn default_timeout_multiple() -> u32 {
    3
}

fn default_grace_millis() -> u64 {
    500
}

impl LivenessConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_millis)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle_secs(),
            timeout_multiple: default_timeout_multiple(),
            grace_millis: default_grace_millis(),
        }
    }
}
