//! Tunnel session driver
//!
//! One task per accepted client connection. The task owns the client
//! handshake, the upstream link for this session, and the relay loop; the
//! only shared state is the session registry entry. Each outgoing stream
//! gets a dedicated writer task fed over a channel, so writes from the relay
//! loop never interleave and never block the loop itself. Framed envelope
//! reads go through their own reader task because they are not safe to
//! cancel mid-frame; raw client reads are, and stay inline in the loop.

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

use burrow_crypto::CipherSuite;
use burrow_protocol::{
    framed, fresh_id, AgentBody, BodyKind, Envelope, MessageBody, ProtocolError, ProxyBodyType,
};
use burrow_session::{IdleEvent, IdleTracker, RegistryError, SessionRegistry};

use crate::adapter::{ClientProtocol, ConnectRequest, Handshake};
use crate::AgentState;

/// Sender toward the client writer task.
pub type LocalHandle = UnboundedSender<Bytes>;
/// Sender toward the upstream writer task.
pub type RemoteHandle = UnboundedSender<Envelope>;

pub type AgentRegistry = SessionRegistry<LocalHandle, RemoteHandle>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("client closed during handshake")]
    ClientClosed,

    #[error("client handshake timed out")]
    HandshakeTimeout,

    #[error(transparent)]
    Adapter(#[from] crate::adapter::AdapterError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("upstream link closed")]
    LinkClosed,

    #[error("proxy did not confirm the target connection in time")]
    ConfirmTimeout,

    #[error("proxy could not reach {host}:{port}")]
    TargetConnectFailure { host: String, port: u16 },

    #[error("link went stale")]
    StaleLink,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why the relay loop stopped. Logged at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    RemoteDisconnect,
    RemoteClosed,
    Stale,
}

pub async fn run_session(
    state: Arc<AgentState>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) -> Result<(), SessionError> {
    let conn_id = fresh_id();
    debug!(session = %conn_id, %peer, "client connected");

    let result = drive(&state, &conn_id, stream).await;
    // Dropping the entry drops both channel senders held by the registry;
    // the per-session clones unwind as the task itself returns.
    state.registry.remove(&conn_id);
    result
}

async fn drive(
    state: &Arc<AgentState>,
    conn_id: &str,
    stream: TcpStream,
) -> Result<(), SessionError> {
    let (mut client_read, client_write) = stream.into_split();

    let (local_tx, local_rx) = mpsc::unbounded_channel::<Bytes>();
    let client_writer = tokio::spawn(write_bytes(client_write, local_rx));

    // Client handshake, bounded by the connect timeout.
    let handshake = timeout(
        state.config.upstream.connect_timeout(),
        client_handshake(&mut client_read, &local_tx),
    )
    .await
    .map_err(|_| SessionError::HandshakeTimeout)?;
    let (proto, request) = match handshake {
        Ok(parsed) => parsed,
        Err(e) => {
            drop(local_tx);
            finish_writers(state, conn_id, vec![client_writer]).await;
            return Err(e);
        }
    };
    info!(
        session = %conn_id,
        protocol = ?proto.kind(),
        target = %format!("{}:{}", request.host, request.port),
        "connect request"
    );

    state.registry.create(conn_id, local_tx.clone())?;

    // Dial the proxy. The client gets a protocol-level failure reply if the
    // upstream link cannot be established at all.
    let upstream = match timeout(
        state.config.upstream.connect_timeout(),
        TcpStream::connect(&state.config.upstream.endpoint),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = local_tx.send(Bytes::from(proto.connect_reply(false)));
            state.registry.remove(conn_id);
            drop(local_tx);
            finish_writers(state, conn_id, vec![client_writer]).await;
            return Err(e.into());
        }
        Err(_) => {
            let _ = local_tx.send(Bytes::from(proto.connect_reply(false)));
            state.registry.remove(conn_id);
            drop(local_tx);
            finish_writers(state, conn_id, vec![client_writer]).await;
            return Err(SessionError::HandshakeTimeout);
        }
    };
    let (mut upstream_read, upstream_write) = upstream.into_split();

    let (remote_tx, remote_rx) = mpsc::unbounded_channel::<Envelope>();
    let upstream_writer = tokio::spawn(write_envelopes(
        upstream_write,
        remote_rx,
        state.suite.clone(),
    ));

    let connect = Envelope::agent(
        &state.config.security.token,
        state.cipher,
        AgentBody::connect(conn_id, &request.host, request.port),
    );
    remote_tx.send(connect).map_err(|_| SessionError::LinkClosed)?;

    // Await the proxy's verdict on the target connection.
    let confirmed = await_confirmation(state, &request, &mut upstream_read).await;
    let writers = vec![client_writer, upstream_writer];
    match confirmed {
        Ok(()) => {}
        Err(e) => {
            let reply = proto.connect_reply(false);
            if !reply.is_empty() {
                let _ = local_tx.send(Bytes::from(reply));
            }
            state.registry.remove(conn_id);
            drop(local_tx);
            drop(remote_tx);
            finish_writers(state, conn_id, writers).await;
            return Err(e);
        }
    }

    state
        .registry
        .bind_remote(conn_id, remote_tx.clone(), &request.host, request.port)?;
    state.registry.activate(conn_id)?;

    // Every exit from here on, including a client that vanished before the
    // success reply could be delivered, runs the closing tail below.
    let outcome = enter_relaying(
        state,
        conn_id,
        &proto,
        request.remainder,
        &mut client_read,
        upstream_read,
        &local_tx,
        &remote_tx,
    )
    .await;

    // Tell the proxy we are going away, then release the registry entry so
    // its sender clones drop and the writers can drain to completion.
    let _ = remote_tx.send(Envelope::agent(
        &state.config.security.token,
        state.cipher,
        AgentBody::disconnect(),
    ));
    state.registry.remove(conn_id);
    drop(local_tx);
    drop(remote_tx);
    finish_writers(state, conn_id, writers).await;

    match outcome? {
        CloseReason::Stale => Err(SessionError::StaleLink),
        reason => {
            info!(session = %conn_id, ?reason, "session closed");
            Ok(())
        }
    }
}

/// Read from the client until the adapter yields a connect request,
/// forwarding any interim protocol replies.
async fn client_handshake(
    client_read: &mut OwnedReadHalf,
    local_tx: &LocalHandle,
) -> Result<(ClientProtocol, ConnectRequest), SessionError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    let n = client_read.read(&mut chunk).await?;
    if n == 0 {
        return Err(SessionError::ClientClosed);
    }
    buf.extend_from_slice(&chunk[..n]);
    let mut proto = ClientProtocol::detect(buf[0]);

    loop {
        loop {
            match proto.advance(&mut buf)? {
                Handshake::Connect(request) => return Ok((proto, request)),
                Handshake::Reply(reply) => {
                    local_tx
                        .send(Bytes::from(reply))
                        .map_err(|_| SessionError::ClientClosed)?;
                }
                Handshake::NeedMoreData => break,
            }
        }
        let n = client_read.read(&mut chunk).await?;
        if n == 0 {
            return Err(SessionError::ClientClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn await_confirmation(
    state: &Arc<AgentState>,
    request: &ConnectRequest,
    upstream_read: &mut OwnedReadHalf,
) -> Result<(), SessionError> {
    let confirm = timeout(
        state.config.upstream.confirm_timeout(),
        framed::read_envelope(upstream_read, BodyKind::Proxy, &state.suite),
    )
    .await
    .map_err(|_| SessionError::ConfirmTimeout)?;

    let envelope = confirm?.ok_or(SessionError::LinkClosed)?;
    let MessageBody::Proxy(body) = &envelope.body else {
        return Err(SessionError::LinkClosed);
    };
    match body.body_type {
        ProxyBodyType::ConnectSuccess => Ok(()),
        _ => Err(SessionError::TargetConnectFailure {
            host: request.host.clone(),
            port: request.port,
        }),
    }
}

/// Deliver the success reply and any handshake remainder, then hand over to
/// the relay loop. Either send can fail if the client or the link already
/// went away; those failures end the session like any relay outcome.
#[allow(clippy::too_many_arguments)]
async fn enter_relaying(
    state: &Arc<AgentState>,
    conn_id: &str,
    proto: &ClientProtocol,
    remainder: Vec<u8>,
    client_read: &mut OwnedReadHalf,
    upstream_read: OwnedReadHalf,
    local_tx: &LocalHandle,
    remote_tx: &RemoteHandle,
) -> Result<CloseReason, SessionError> {
    let reply = proto.connect_reply(true);
    if !reply.is_empty() && local_tx.send(Bytes::from(reply)).is_err() {
        return Err(SessionError::ClientClosed);
    }
    if !remainder.is_empty() {
        let body = AgentBody::data(remainder);
        let envelope = Envelope::agent(&state.config.security.token, state.cipher, body);
        if remote_tx.send(envelope).is_err() {
            return Err(SessionError::LinkClosed);
        }
    }
    relay(state, conn_id, client_read, upstream_read, local_tx, remote_tx).await
}

/// The steady-state relay loop. Returns how the session ended.
async fn relay(
    state: &Arc<AgentState>,
    conn_id: &str,
    client_read: &mut OwnedReadHalf,
    upstream_read: OwnedReadHalf,
    local_tx: &LocalHandle,
    remote_tx: &RemoteHandle,
) -> Result<CloseReason, SessionError> {
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_envelopes(upstream_read, inbound_tx, state.suite.clone()));

    let mut tracker = IdleTracker::new(
        state.config.liveness.idle(),
        state.config.liveness.timeout_multiple,
    );
    let mut chunk = vec![0u8; 16 * 1024];

    let reason = loop {
        tokio::select! {
            read = client_read.read(&mut chunk) => {
                match read {
                    Ok(0) | Err(_) => break CloseReason::ClientClosed,
                    Ok(n) => {
                        let body = AgentBody::data(chunk[..n].to_vec());
                        let envelope =
                            Envelope::agent(&state.config.security.token, state.cipher, body);
                        if remote_tx.send(envelope).is_err() {
                            break CloseReason::RemoteClosed;
                        }
                        tracker.record_send();
                    }
                }
            }
            inbound = inbound_rx.recv() => {
                let envelope = match inbound {
                    None => break CloseReason::RemoteClosed,
                    Some(Err(e)) => {
                        reader.abort();
                        return Err(e.into());
                    }
                    Some(Ok(envelope)) => envelope,
                };
                tracker.record_recv();
                let MessageBody::Proxy(body) = envelope.body else {
                    continue;
                };
                match body.body_type {
                    ProxyBodyType::Data => {
                        let payload = body.payload.unwrap_or_default();
                        if local_tx.send(Bytes::from(payload)).is_err() {
                            break CloseReason::ClientClosed;
                        }
                    }
                    // Peer heartbeats refresh the receive clock above and are
                    // never answered; the proxy is the answering side.
                    ProxyBodyType::Heartbeat => {
                        trace!(session = %conn_id, "peer heartbeat");
                    }
                    ProxyBodyType::Disconnect => break CloseReason::RemoteDisconnect,
                    ProxyBodyType::ConnectSuccess | ProxyBodyType::ConnectFailure => {
                        debug!(session = %conn_id, "late connect verdict dropped");
                    }
                }
            }
            _ = sleep_until(tracker.deadline()) => {
                match tracker.check() {
                    Some(IdleEvent::Expired) => break CloseReason::Stale,
                    Some(IdleEvent::HeartbeatDue) => {
                        let envelope = Envelope::agent(
                            &state.config.security.token,
                            state.cipher,
                            AgentBody::heartbeat(),
                        );
                        if remote_tx.send(envelope).is_err() {
                            break CloseReason::RemoteClosed;
                        }
                        tracker.record_send();
                        trace!(session = %conn_id, "heartbeat sent");
                    }
                    None => {}
                }
            }
        }
    };

    // Late frames may still be queued; log and drop them.
    while let Ok(Ok(envelope)) = inbound_rx.try_recv() {
        debug!(session = %conn_id, id = %envelope.body.id(), "late frame dropped");
    }
    reader.abort();
    Ok(reason)
}

/// Give in-flight writes a bounded grace period to drain. A writer that
/// misses the deadline is aborted so it releases its socket half; otherwise
/// a peer that stops reading would keep the leg open past teardown.
async fn finish_writers(
    state: &Arc<AgentState>,
    conn_id: &str,
    writers: Vec<JoinHandle<()>>,
) {
    for mut writer in writers {
        if timeout(state.config.liveness.grace(), &mut writer).await.is_err() {
            warn!(session = %conn_id, "writer did not drain within grace period, aborting");
            writer.abort();
        }
    }
}

/// Client writer task: owns the write half, preserves channel order.
async fn write_bytes(mut writer: OwnedWriteHalf, mut rx: UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Upstream writer task: frames and writes envelopes in channel order.
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

/// Upstream reader task. Framed reads are not cancellation safe, so the
/// relay loop selects on this channel instead of the stream.
async fn read_envelopes(
    mut reader: OwnedReadHalf,
    tx: UnboundedSender<Result<Envelope, ProtocolError>>,
    suite: CipherSuite,
) {
    loop {
        match framed::read_envelope(&mut reader, BodyKind::Proxy, &suite).await {
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
