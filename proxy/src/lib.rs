//! Burrow proxy
//!
//! Accepts framed envelope links from agents, unwraps tunneled traffic and
//! relays it to the requested targets.

pub mod config;
pub mod relay;

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

use burrow_crypto::CipherSuite;

use crate::config::ProxyConfig;
use crate::relay::ProxyRegistry;

/// Shared proxy state, built once at startup.
pub struct ProxyState {
    pub config: ProxyConfig,
    pub suite: CipherSuite,
    pub registry: Arc<ProxyRegistry>,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Arc<Self> {
        let suite = CipherSuite::from_passphrase(&config.security.passphrase);
        Arc::new(Self {
            config,
            suite,
            registry: ProxyRegistry::new(),
        })
    }
}

pub async fn run(config: ProxyConfig) -> Result<()> {
    let state = ProxyState::new(config);
    let listener = TcpListener::bind(state.config.listen.bind).await?;
    info!(addr = %state.config.listen.bind, "proxy listening");
    serve(listener, state).await
}

/// Accept loop. Exposed separately so tests can bind an ephemeral port.
pub async fn serve(listener: TcpListener, state: Arc<ProxyState>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = relay::run_link(state, stream, peer).await {
                warn!(%peer, error = %e, "link ended with error");
            }
        });
    }
}
