//! Heartbeat and stale-link behavior
//!
//! The agent runs against a scripted peer that speaks the framed envelope
//! protocol, so each test controls exactly what the far side sends and when.


use std::time::Duration;

use harness::{agent_config, socks4_connect, start_agent, wait_until, TOKEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use burrow_crypto::EncryptionType;
use burrow_protocol::{framed, AgentBodyType, BodyKind, Envelope, MessageBody, ProxyBody};

/// Accept one link, consume the connect frame and confirm it.
async fn establish(listener: &TcpListener) -> TcpStream {
    let suite = harness::suite();
    let (mut stream, _) = listener.accept().await.unwrap();

    let connect = framed::read_envelope(&mut stream, BodyKind::Agent, &suite)
        .await
        .unwrap()
        .expect("connect frame");
    let MessageBody::Agent(body) = &connect.body else {
        panic!("agent body expected");
    };
    assert_eq!(body.body_type, AgentBodyType::Connect);

    let confirm = Envelope::proxy(
        TOKEN,
        connect.encryption,
        ProxyBody::connect_success(&body.id),
    );
    framed::write_envelope(&mut stream, &confirm, &suite)
        .await
        .unwrap();
    stream
}

#[tokio::test]
async fn heartbeat_emitted_after_send_idle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();

    let mut config = agent_config(peer_addr, "aes");
    config.liveness.idle_secs = 1;
    config.liveness.timeout_multiple = 10;
    let (agent_addr, _state) = start_agent(config).await;

    let mut client = TcpStream::connect(agent_addr).await.unwrap();
    client
        .write_all(&socks4_connect("127.0.0.1:9".parse().unwrap()))
        .await
        .unwrap();
    let mut peer = establish(&listener).await;

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5a);

    // With the client quiet, the next frame must be a heartbeat, within a
    // small margin of the one-second idle threshold.
    let suite = harness::suite();
    let frame = timeout(
        Duration::from_secs(3),
        framed::read_envelope(&mut peer, BodyKind::Agent, &suite),
    )
    .await
    .expect("heartbeat should arrive")
    .unwrap()
    .expect("frame expected");
    let MessageBody::Agent(body) = frame.body else {
        panic!("agent body expected");
    };
    assert_eq!(body.body_type, AgentBodyType::Heartbeat);
}

#[tokio::test]
async fn peer_heartbeats_are_swallowed_and_never_answered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();

    // Long idle so the agent emits no heartbeats of its own.
    let (agent_addr, _state) = start_agent(agent_config(peer_addr, "plain")).await;

    let mut client = TcpStream::connect(agent_addr).await.unwrap();
    client
        .write_all(&socks4_connect("127.0.0.1:9".parse().unwrap()))
        .await
        .unwrap();
    let mut peer = establish(&listener).await;

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();

    let suite = harness::suite();
    let heartbeat = Envelope::proxy(TOKEN, EncryptionType::Plain, ProxyBody::heartbeat());
    framed::write_envelope(&mut peer, &heartbeat, &suite)
        .await
        .unwrap();
    let data = Envelope::proxy(TOKEN, EncryptionType::Plain, ProxyBody::data(b"payload".to_vec()));
    framed::write_envelope(&mut peer, &data, &suite)
        .await
        .unwrap();

    // The client sees only the data; the heartbeat is consumed by the agent.
    let mut received = [0u8; 7];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"payload");

    // And the agent must not answer the heartbeat.
    let answered = timeout(
        Duration::from_millis(500),
        framed::read_envelope(&mut peer, BodyKind::Agent, &suite),
    )
    .await;
    assert!(answered.is_err(), "agent answered a heartbeat");
}

#[tokio::test]
async fn undrained_client_backlog_is_cut_off_at_teardown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();

    let mut config = agent_config(peer_addr, "plain");
    config.liveness.grace_millis = 200;
    let (agent_addr, state) = start_agent(config).await;

    let mut client = TcpStream::connect(agent_addr).await.unwrap();
    client
        .write_all(&socks4_connect("127.0.0.1:9".parse().unwrap()))
        .await
        .unwrap();
    let mut peer = establish(&listener).await;

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5a);

    // Queue far more data than the sockets can buffer while the client reads
    // nothing, then close the link. Teardown must not hang on the backlog:
    // the client writer is cut off once the grace period runs out.
    let suite = harness::suite();
    const CHUNK: usize = 64 * 1024;
    const TOTAL: usize = 32 * 1024 * 1024;
    for _ in 0..(TOTAL / CHUNK) {
        let data = Envelope::proxy(TOKEN, EncryptionType::Plain, ProxyBody::data(vec![0xab; CHUNK]));
        framed::write_envelope(&mut peer, &data, &suite).await.unwrap();
    }
    drop(peer);

    assert!(
        wait_until(|| state.registry.count() == 0, Duration::from_secs(10)).await,
        "session should leave the registry"
    );
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Whatever was already in flight may still arrive; the bulk of the
    // backlog must not.
    let mut drained = 0usize;
    let mut buf = vec![0u8; CHUNK];
    loop {
        match timeout(Duration::from_secs(2), client.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => drained += n,
        }
    }
    assert!(
        drained < TOTAL,
        "client drained the whole backlog ({drained} bytes) after teardown"
    );
}

#[tokio::test]
async fn client_gone_before_the_verdict_still_tears_down_cleanly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();

    let (agent_addr, state) = start_agent(agent_config(peer_addr, "plain")).await;

    let mut client = TcpStream::connect(agent_addr).await.unwrap();
    client
        .write_all(&socks4_connect("127.0.0.1:9".parse().unwrap()))
        .await
        .unwrap();
    drop(client);
    let mut peer = establish(&listener).await;

    // However far the session got before noticing the client is gone, the
    // peer must still see a disconnect frame and the registry must drain.
    let suite = harness::suite();
    let frame = timeout(
        Duration::from_secs(5),
        framed::read_envelope(&mut peer, BodyKind::Agent, &suite),
    )
    .await
    .expect("disconnect should arrive")
    .unwrap()
    .expect("frame expected");
    let MessageBody::Agent(body) = frame.body else {
        panic!("agent body expected");
    };
    assert_eq!(body.body_type, AgentBodyType::Disconnect);
    assert!(
        wait_until(|| state.registry.count() == 0, Duration::from_secs(3)).await,
        "session should leave the registry"
    );
}

#[tokio::test]
async fn silent_peer_expires_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();

    let mut config = agent_config(peer_addr, "aes");
    config.liveness.idle_secs = 1;
    config.liveness.timeout_multiple = 2;
    let (agent_addr, state) = start_agent(config).await;

    let mut client = TcpStream::connect(agent_addr).await.unwrap();
    client
        .write_all(&socks4_connect("127.0.0.1:9".parse().unwrap()))
        .await
        .unwrap();
    let _peer = establish(&listener).await;

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5a);

    // The peer now goes silent without closing. Expiry is 2 seconds; the
    // agent must tear the session down and close the client.
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(6), client.read(&mut buf))
        .await
        .expect("stale session should close the client")
        .unwrap();
    assert_eq!(n, 0);
    assert!(
        wait_until(
            || state.registry.count() == 0,
            Duration::from_secs(3)
        )
        .await,
        "stale session should leave the registry"
    );
}
