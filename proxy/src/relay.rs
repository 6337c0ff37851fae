//! Agent-link handling and target relay
//!
//! One task per accepted agent link. The first frame must be a connect
//! request carrying the shared token and the session id; everything after
//! that is relayed between the link and the dialed target. The cipher tag
//! of the connect frame is mirrored on every frame the proxy sends back, so
//! the originator's choice governs both directions. Framed reads from the
//! link run in their own task because they cannot be cancelled mid-frame.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout};
use tracing::{debug, info, trace, warn};

use burrow_crypto::{CipherSuite, EncryptionType};
use burrow_protocol::{
    framed, AgentBodyType, BodyKind, Envelope, MessageBody, ProtocolError, ProxyBody,
};
use burrow_session::{IdleEvent, IdleTracker, RegistryError, SessionRegistry};

use crate::ProxyState;

/// Sender toward the agent-link writer task.
pub type LinkHandle = UnboundedSender<Envelope>;
/// Sender toward the target writer task.
pub type TargetHandle = UnboundedSender<Bytes>;

pub type ProxyRegistry = SessionRegistry<LinkHandle, TargetHandle>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("token mismatch")]
    TokenMismatch,

    #[error("link handshake timed out")]
    HandshakeTimeout,

    #[error("first frame was not a connect request")]
    UnexpectedFirstFrame,

    #[error("agent link closed")]
    LinkClosed,

    #[error("could not reach {host}:{port}")]
    TargetConnectFailure { host: String, port: u16 },

    #[error("link went stale")]
    StaleLink,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    AgentDisconnect,
    LinkClosed,
    TargetClosed,
    Stale,
}

pub async fn run_link(
    state: Arc<ProxyState>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) -> Result<(), RelayError> {
    debug!(%peer, "agent link accepted");
    let (mut link_read, link_write) = stream.into_split();

    let (link_tx, link_rx) = mpsc::unbounded_channel::<Envelope>();
    let link_writer = tokio::spawn(write_envelopes(link_write, link_rx, state.suite.clone()));

    // The connect frame fixes the session id, the target address and the
    // cipher tag mirrored on every reply.
    let first = timeout(
        state.config.listen.handshake_timeout(),
        framed::read_envelope(&mut link_read, BodyKind::Agent, &state.suite),
    )
    .await
    .map_err(|_| RelayError::HandshakeTimeout)
    .and_then(|read| Ok(read?));
    let first = match first {
        Ok(Some(envelope)) => envelope,
        Ok(None) => {
            drop(link_tx);
            finish_writers(&state, vec![link_writer]).await;
            return Ok(());
        }
        Err(e) => {
            drop(link_tx);
            finish_writers(&state, vec![link_writer]).await;
            return Err(e);
        }
    };

    if first.token != state.config.security.token {
        warn!(%peer, "rejecting link: bad token");
        drop(link_tx);
        finish_writers(&state, vec![link_writer]).await;
        return Err(RelayError::TokenMismatch);
    }

    let cipher = first.encryption;
    let MessageBody::Agent(body) = first.body else {
        drop(link_tx);
        finish_writers(&state, vec![link_writer]).await;
        return Err(RelayError::UnexpectedFirstFrame);
    };
    let (AgentBodyType::Connect, Some(host), Some(port)) =
        (body.body_type, body.target_host, body.target_port)
    else {
        drop(link_tx);
        finish_writers(&state, vec![link_writer]).await;
        return Err(RelayError::UnexpectedFirstFrame);
    };
    let session_id = body.id;

    if let Err(e) = state.registry.create(&session_id, link_tx.clone()) {
        // The existing session wins; this link only gets a failure verdict.
        warn!(session = %session_id, "duplicate session id");
        let _ = link_tx.send(reply(&state, cipher, ProxyBody::connect_failure(&session_id)));
        drop(link_tx);
        finish_writers(&state, vec![link_writer]).await;
        return Err(e.into());
    }

    let result = drive(
        &state,
        &session_id,
        cipher,
        &host,
        port,
        link_read,
        link_tx,
        link_writer,
    )
    .await;
    state.registry.remove(&session_id);
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    state: &Arc<ProxyState>,
    session_id: &str,
    cipher: EncryptionType,
    host: &str,
    port: u16,
    link_read: OwnedReadHalf,
    link_tx: LinkHandle,
    link_writer: JoinHandle<()>,
) -> Result<(), RelayError> {
    let target = match timeout(
        state.config.target.connect_timeout(),
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            info!(session = %session_id, target = %format!("{host}:{port}"), error = %e, "target connect failed");
            let _ = link_tx.send(reply(state, cipher, ProxyBody::connect_failure(session_id)));
            state.registry.remove(session_id);
            drop(link_tx);
            finish_writers(state, vec![link_writer]).await;
            return Err(RelayError::TargetConnectFailure {
                host: host.to_string(),
                port,
            });
        }
        Err(_) => {
            let _ = link_tx.send(reply(state, cipher, ProxyBody::connect_failure(session_id)));
            state.registry.remove(session_id);
            drop(link_tx);
            finish_writers(state, vec![link_writer]).await;
            return Err(RelayError::TargetConnectFailure {
                host: host.to_string(),
                port,
            });
        }
    };
    let (mut target_read, target_write) = target.into_split();

    let (target_tx, target_rx) = mpsc::unbounded_channel::<Bytes>();
    let target_writer = tokio::spawn(write_bytes(target_write, target_rx));

    state
        .registry
        .bind_remote(session_id, target_tx.clone(), host, port)?;
    state.registry.activate(session_id)?;
    link_tx
        .send(reply(state, cipher, ProxyBody::connect_success(session_id)))
        .map_err(|_| RelayError::LinkClosed)?;
    info!(session = %session_id, target = %format!("{host}:{port}"), "session established");

    let outcome = relay(
        state,
        session_id,
        cipher,
        link_read,
        &mut target_read,
        &link_tx,
        &target_tx,
    )
    .await;

    // Release the registry entry so its sender clones drop and the writers
    // can drain to completion.
    let _ = link_tx.send(reply(state, cipher, ProxyBody::disconnect()));
    state.registry.remove(session_id);
    drop(link_tx);
    drop(target_tx);
    finish_writers(state, vec![link_writer, target_writer]).await;

    match outcome? {
        CloseReason::Stale => Err(RelayError::StaleLink),
        reason => {
            info!(session = %session_id, ?reason, "session closed");
            Ok(())
        }
    }
}

async fn relay(
    state: &Arc<ProxyState>,
    session_id: &str,
    cipher: EncryptionType,
    link_read: OwnedReadHalf,
    target_read: &mut OwnedReadHalf,
    link_tx: &LinkHandle,
    target_tx: &TargetHandle,
) -> Result<CloseReason, RelayError> {
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_envelopes(link_read, inbound_tx, state.suite.clone()));

    let mut tracker = IdleTracker::new(
        state.config.liveness.idle(),
        state.config.liveness.timeout_multiple,
    );
    let mut chunk = vec![0u8; 16 * 1024];

    let reason = loop {
        tokio::select! {
            inbound = inbound_rx.recv() => {
                let envelope = match inbound {
                    None => break CloseReason::LinkClosed,
                    Some(Err(e)) => {
                        reader.abort();
                        return Err(e.into());
                    }
                    Some(Ok(envelope)) => envelope,
                };
                if envelope.token != state.config.security.token {
                    warn!(session = %session_id, "frame with bad token");
                    reader.abort();
                    return Err(RelayError::TokenMismatch);
                }
                tracker.record_recv();
                let MessageBody::Agent(body) = envelope.body else {
                    continue;
                };
                match body.body_type {
                    AgentBodyType::Data => {
                        if !state.registry.is_activated(session_id) {
                            debug!(session = %session_id, "data before activation dropped");
                            continue;
                        }
                        let payload = body.payload.unwrap_or_default();
                        if target_tx.send(Bytes::from(payload)).is_err() {
                            break CloseReason::TargetClosed;
                        }
                    }
                    // The proxy is the answering side of the heartbeat
                    // exchange; the agent never answers ours.
                    AgentBodyType::Heartbeat => {
                        trace!(session = %session_id, "peer heartbeat");
                        if link_tx.send(reply(state, cipher, ProxyBody::heartbeat())).is_err() {
                            break CloseReason::LinkClosed;
                        }
                        tracker.record_send();
                    }
                    AgentBodyType::Disconnect => break CloseReason::AgentDisconnect,
                    AgentBodyType::Connect => {
                        debug!(session = %session_id, "duplicate connect frame dropped");
                    }
                }
            }
            read = target_read.read(&mut chunk) => {
                match read {
                    Ok(0) | Err(_) => break CloseReason::TargetClosed,
                    Ok(n) => {
                        let body = ProxyBody::data(chunk[..n].to_vec());
                        if link_tx.send(reply(state, cipher, body)).is_err() {
                            break CloseReason::LinkClosed;
                        }
                        tracker.record_send();
                    }
                }
            }
            _ = sleep_until(tracker.deadline()) => {
                match tracker.check() {
                    Some(IdleEvent::Expired) => break CloseReason::Stale,
                    Some(IdleEvent::HeartbeatDue) => {
                        if link_tx.send(reply(state, cipher, ProxyBody::heartbeat())).is_err() {
                            break CloseReason::LinkClosed;
                        }
                        tracker.record_send();
                        trace!(session = %session_id, "heartbeat sent");
                    }
                    None => {}
                }
            }
        }
    };

    while let Ok(Ok(envelope)) = inbound_rx.try_recv() {
        debug!(session = %session_id, id = %envelope.body.id(), "late frame dropped");
    }
    reader.abort();
    Ok(reason)
}

/// Wrap a proxy body in an envelope mirroring the session's cipher tag.
fn reply(state: &ProxyState, cipher: EncryptionType, body: ProxyBody) -> Envelope {
    Envelope::proxy(&state.config.security.token, cipher, body)
}

/// A writer that misses the grace deadline is aborted so it releases its
/// socket half; otherwise a peer that stops reading would keep the leg open
/// past teardown.
async fn finish_writers(state: &Arc<ProxyState>, writers: Vec<JoinHandle<()>>) {
    for mut writer in writers {
        if timeout(state.config.liveness.grace(), &mut writer).await.is_err() {
            warn!("writer did not drain within grace period, aborting");
            writer.abort();
        }
    }
}

async fn write_bytes(mut writer: OwnedWriteHalf, mut rx: UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_envelopes(
    mut writer: OwnedWriteHalf,
    mut rx: UnboundedReceiver<Envelope>,
    suite: CipherSuite,
) {
    while let Some(envelope) = rx.recv().await {
        if framed::write_envelope(&mut writer, &envelope, &suite)
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Link reader task. Framed reads are not cancellation safe, so the relay
/// loop selects on this channel instead of the stream.
async fn read_envelopes(
    mut reader: OwnedReadHalf,
    tx: UnboundedSender<Result<Envelope, ProtocolError>>,
    suite: CipherSuite,
) {
    loop {
        match framed::read_envelope(&mut reader, BodyKind::Agent, &suite).await {
            Ok(Some(envelope)) => {
                if tx.send(Ok(envelope)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}
