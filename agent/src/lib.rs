//! Burrow agent
//!
//! Accepts SOCKS4, SOCKS5 and HTTP clients on a local listener and tunnels
//! each connection to a burrow proxy over the framed envelope protocol.

pub mod adapter;
pub mod config;
pub mod session;

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use burrow_crypto::{CipherSuite, EncryptionType};

use crate::config::AgentConfig;
use crate::session::AgentRegistry;

/// Shared agent state, built once at startup.
pub struct AgentState {
    pub config: AgentConfig,
    pub suite: CipherSuite,
    /// Cipher tag used for every session this agent originates.
    pub cipher: EncryptionType,
    pub registry: Arc<AgentRegistry>,
}

impl AgentState {
    pub fn new(config: AgentConfig) -> Result<Arc<Self>> {
        let Some(cipher) = EncryptionType::from_name(&config.security.cipher) else {
            bail!("unknown cipher name: {:?}", config.security.cipher);
        };
        let suite = CipherSuite::from_passphrase(&config.security.passphrase);
        Ok(Arc::new(Self {
            config,
            suite,
            cipher,
            registry: AgentRegistry::new(),
        }))
    }
}

pub async fn run(config: AgentConfig) -> Result<()> {
    let state = AgentState::new(config)?;
    let listener = TcpListener::bind(state.config.listen.bind).await?;
    info!(
        addr = %state.config.listen.bind,
        upstream = %state.config.upstream.endpoint,
        cipher = state.cipher.name(),
        "agent listening"
    );
    serve(listener, state).await
}

/// Accept loop. Exposed separately so tests can bind an ephemeral port.
pub async fn serve(listener: TcpListener, state: Arc<AgentState>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = session::run_session(state, stream, peer).await {
                warn!(%peer, error = %e, "session ended with error");
            }
        });
    }
}
