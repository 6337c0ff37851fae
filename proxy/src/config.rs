//! Proxy configuration

use anyhow::Result;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Agent-facing listener
    #[serde(default)]
    pub listen: ListenConfig,

    /// Shared credential
    #[serde(default)]
    pub security: SecurityConfig,

    /// Outbound target connections
    #[serde(default)]
    pub target: TargetConfig,

    /// Heartbeat and stale-link thresholds
    #[serde(default)]
    pub liveness: LivenessConfig,
}

impl ProxyConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: ProxyConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            security: SecurityConfig::default(),
            target: TargetConfig::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

/// Agent-facing listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Bind address for agent links
    #[serde(default = "default_listen_bind")]
    pub bind: SocketAddr,

    /// How long a fresh link may take to present its connect frame
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_listen_bind() -> SocketAddr {
    "0.0.0.0:10081".parse().expect("static address")
}

fn default_handshake_timeout() -> u64 {
    20
}

impl ListenConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: default_listen_bind(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

/// Shared credential
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Opaque shared token every envelope must carry
    #[serde(default = "default_token")]
    pub token: String,

    /// Passphrase the AES key is derived from
    #[serde(default = "default_passphrase")]
    pub passphrase: String,
}

fn default_token() -> String {
    "burrow-dev-token".to_string()
}

fn default_passphrase() -> String {
    "burrow-dev-passphrase".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
            passphrase: default_passphrase(),
        }
    }
}

/// Outbound target connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Dial timeout toward the requested target
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

impl TargetConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
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
