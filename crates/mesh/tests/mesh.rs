//! End-to-end mesh tests over a live signaler with in-memory backends.
//!
//! Peers connect over loopback host candidates, so no ICE servers are
//! configured. Joins are staggered so introductions flow one way.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use commune_mesh::signaler_url;
use commune_mesh::Adapter;
use commune_mesh::AdapterConfig;
use commune_mesh::NamedAdapter;
use commune_mesh::NamedAdapterConfig;
use commune_signaler::auth::DisabledAuthenticator;
use commune_signaler::brokers::ProcessBroker;
use commune_signaler::persistence::MemoryPersister;
use commune_signaler::server::ServerConfig;
use commune_signaler::server::Signaler;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn start_signaler() -> (SocketAddr, CancellationToken) {
    let signaler = Arc::new(Signaler::new(
        Arc::new(MemoryPersister::new()),
        Arc::new(ProcessBroker::new()),
        Arc::new(DisabledAuthenticator),
        ServerConfig::default(),
    ));

    let shutdown = CancellationToken::new();
    let bound = signaler
        .bind("127.0.0.1:0".parse().unwrap(), shutdown.clone())
        .await
        .unwrap();
    let addr = bound.local_addr();
    tokio::spawn(bound.serve());

    (addr, shutdown)
}

fn adapter_config(channel: &str) -> AdapterConfig {
    AdapterConfig {
        channels: vec![channel.to_string()],
        ice_servers: vec![],
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_peer_echo() {
    init_logging();
    let (addr, _shutdown) = start_signaler().await;
    let url = signaler_url(&format!("ws://{addr}/"), "echo-room", "join-pw").unwrap();

    let token = CancellationToken::new();
    let a = Adapter::new(&url, "seal-key", adapter_config("echo"), token.clone());
    let b = Adapter::new(&url, "seal-key", adapter_config("echo"), token.clone());

    let mut a_peers = a.open().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let mut b_peers = b.open().await.unwrap();

    let a_peer = timeout(Duration::from_secs(30), a_peers.recv())
        .await
        .expect("a never saw a peer")
        .unwrap();
    let b_peer = timeout(Duration::from_secs(30), b_peers.recv())
        .await
        .expect("b never saw a peer")
        .unwrap();
    assert_eq!(a_peer.channel_id, "echo");
    assert_eq!(b_peer.channel_id, "echo");

    tokio::spawn(async move {
        let mut buffer = vec![0u8; 1024];
        let n = b_peer.conn.read(&mut buffer).await.unwrap();
        b_peer.conn.write(&Bytes::copy_from_slice(&buffer[..n])).await.unwrap();
    });

    a_peer.conn.write(&Bytes::from_static(b"ping")).await.unwrap();
    let mut buffer = vec![0u8; 1024];
    let n = timeout(Duration::from_secs(10), a_peer.conn.read(&mut buffer))
        .await
        .expect("echo never arrived")
        .unwrap();
    assert_eq!(&buffer[..n], b"ping");

    token.cancel();
    a.wait().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reintroduction_replaces_peer() {
    init_logging();
    let (addr, _shutdown) = start_signaler().await;
    let url = signaler_url(&format!("ws://{addr}/"), "replace-room", "join-pw").unwrap();

    let watcher_token = CancellationToken::new();
    let watcher = Adapter::new(&url, "seal-key", adapter_config("data"), watcher_token.clone());
    let mut watcher_peers = watcher.open().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    // The visitor carries a static transport id across restarts.
    let visitor_config = AdapterConfig {
        id: "visitor".to_string(),
        ..adapter_config("data")
    };

    let first_token = CancellationToken::new();
    let first = Adapter::new(&url, "seal-key", visitor_config.clone(), first_token);
    let _first_peers = first.open().await.unwrap();

    let peer = timeout(Duration::from_secs(30), watcher_peers.recv())
        .await
        .expect("watcher never saw the visitor")
        .unwrap();
    assert_eq!(peer.peer_id, "visitor");

    first.close();
    first.wait().await.unwrap();

    // A restarted visitor re-introduces under the same id; the watcher
    // must replace the dead record and emit a fresh channel.
    let second_token = CancellationToken::new();
    let second = Adapter::new(&url, "seal-key", visitor_config, second_token.clone());
    let _second_peers = second.open().await.unwrap();

    let replacement = timeout(Duration::from_secs(30), watcher_peers.recv())
        .await
        .expect("watcher never saw the restarted visitor")
        .unwrap();
    assert_eq!(replacement.peer_id, "visitor");
    assert_eq!(replacement.channel_id, "data");

    second.close();
    second.wait().await.unwrap();
    watcher_token.cancel();
    watcher.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_peer_name_claim() {
    init_logging();
    let (addr, _shutdown) = start_signaler().await;
    let url = signaler_url(&format!("ws://{addr}/"), "named-room", "join-pw").unwrap();

    let names: Vec<String> = ["n1", "n2", "n3"].iter().map(|s| s.to_string()).collect();
    let token = CancellationToken::new();

    let adapters: Vec<NamedAdapter> = (0..3)
        .map(|_| {
            NamedAdapter::new(
                &url,
                "seal-key",
                NamedAdapterConfig {
                    names: names.clone(),
                    channels: vec!["chat".to_string()],
                    ice_servers: vec![],
                    timeout: Duration::from_secs(2),
                    kicks: Duration::from_secs(1),
                    ..Default::default()
                },
                token.clone(),
            )
        })
        .collect();

    let mut streams = Vec::new();
    for adapter in &adapters {
        streams.push(adapter.open().await.unwrap());
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    // Every member ends up seeing the two names the others claimed; with
    // fully contested candidate sets that forces three distinct claims.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let mut all_seen = Vec::new();
    for (peers, _errors) in &mut streams {
        let mut seen = HashSet::new();
        while seen.len() < 2 {
            let peer = tokio::time::timeout_at(deadline, peers.recv())
                .await
                .expect("claim negotiation stalled")
                .unwrap();
            assert_eq!(peer.channel_id, "chat");
            if names.contains(&peer.peer_id) {
                seen.insert(peer.peer_id);
            }
        }
        all_seen.push(seen);
    }

    let union: HashSet<&String> = all_seen.iter().flatten().collect();
    assert_eq!(union.len(), 3, "claimed names were not unique: {all_seen:?}");

    token.cancel();
    for adapter in &adapters {
        adapter.wait().await.unwrap();
    }
}
