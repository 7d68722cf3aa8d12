//! End-to-end mesh tests over loopback TCP with millisecond periods.

use beacond::config::Config;
use beacond::discovery::{Discovery, DiscoveryStats};
use beacond::watch::WatchEvent;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const PERIOD_MS: u64 = 150;

fn config(seeds: Vec<SocketAddr>) -> Config {
    Config {
        port: 0,
        seed: seeds,
        advertise: "127.0.0.1".into(),
        ttl_ms: 8 * 60 * 60 * 1000,
        period_ms: PERIOD_MS,
        conn_exp_thresh_ms: 300,
        verbose: false,
        log_format: "pretty".into(),
    }
}

fn addr_of(node: &Discovery) -> SocketAddr {
    let addr = node.node().0.first().expect("node has an address");
    format!("{}:{}", addr.host, addr.port).parse().unwrap()
}

fn watch_channel() -> (
    impl Fn(WatchEvent) + Send + 'static,
    mpsc::UnboundedReceiver<WatchEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |ev| {
            let _ = tx.send(ev);
        },
        rx,
    )
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<WatchEvent>, secs: u64) -> WatchEvent {
    timeout(Duration::from_secs(secs), rx.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch channel closed")
}

async fn wait_for(node: &Discovery, secs: u64, pred: impl Fn(&DiscoveryStats) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let stats = node.stats().await.expect("node alive");
        if pred(&stats) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached in {secs}s, last stats: {stats:?}");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_publish_then_discover() {
    let a = Discovery::start(config(vec![])).await.unwrap();
    let b = Discovery::start(config(vec![addr_of(&a)])).await.unwrap();
    assert_ne!(a.id(), b.id());

    // Seed-only start: the empty node joins the mesh.
    wait_for(&a, 5, |s| s.edges == 1).await;
    wait_for(&b, 5, |s| s.edges == 1).await;

    a.publish("svc", b"hello".to_vec());

    let (watch, mut rx) = watch_channel();
    b.discover("svc", 7, watch);

    match next_event(&mut rx, 10).await {
        WatchEvent::Arrived { payload, .. } => assert_eq!(payload, b"hello"),
        other => panic!("unexpected event: {other:?}"),
    }

    // Exactly once per publication.
    assert!(
        timeout(Duration::from_millis(500), rx.recv()).await.is_err(),
        "duplicate delivery"
    );

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_node_diffusion() {
    // C never connects to A directly at startup; the advertisement has to
    // travel through B.
    let a = Discovery::start(config(vec![])).await.unwrap();
    let b = Discovery::start(config(vec![addr_of(&a)])).await.unwrap();
    wait_for(&b, 5, |s| s.edges == 1).await;

    a.publish("svc", b"v1".to_vec());
    sleep(Duration::from_millis(2 * PERIOD_MS)).await;

    let c = Discovery::start(config(vec![addr_of(&b)])).await.unwrap();
    let (watch, mut rx) = watch_channel();
    c.discover("svc", 1, watch);

    match next_event(&mut rx, 15).await {
        WatchEvent::Arrived { payload, .. } => assert_eq!(payload, b"v1"),
        other => panic!("unexpected event: {other:?}"),
    }

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_republish_delivers_new_version() {
    let a = Discovery::start(config(vec![])).await.unwrap();
    let b = Discovery::start(config(vec![addr_of(&a)])).await.unwrap();

    a.publish("svc", b"v1".to_vec());
    let (watch, mut rx) = watch_channel();
    b.discover("svc", 7, watch);

    let first = match next_event(&mut rx, 10).await {
        WatchEvent::Arrived { key_id, payload } => {
            assert_eq!(payload, b"v1");
            key_id
        }
        other => panic!("unexpected event: {other:?}"),
    };

    a.publish("svc", b"v2".to_vec());

    let second = match next_event(&mut rx, 10).await {
        WatchEvent::Arrived { key_id, payload } => {
            assert_eq!(payload, b"v2");
            key_id
        }
        other => panic!("unexpected event: {other:?}"),
    };
    assert_ne!(first, second);

    // Both versions coexist on B until the first one's TTL lapses.
    wait_for(&b, 5, |s| s.key_entries == 2).await;

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retract_reports_loss() {
    let a = Discovery::start(config(vec![])).await.unwrap();
    let b = Discovery::start(config(vec![addr_of(&a)])).await.unwrap();

    a.publish("svc", b"hello".to_vec());
    let (watch, mut rx) = watch_channel();
    b.discover("svc", 7, watch);

    let delivered = match next_event(&mut rx, 10).await {
        WatchEvent::Arrived { key_id, .. } => key_id,
        other => panic!("unexpected event: {other:?}"),
    };

    a.retract("svc");

    match next_event(&mut rx, 10).await {
        WatchEvent::Lost { key_id } => assert_eq!(key_id, delivered),
        other => panic!("unexpected event: {other:?}"),
    }

    // The advertisement table empties out on B.
    wait_for(&b, 5, |s| s.key_entries == 0).await;

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_timeout_reaps_silent_peer() {
    // A peer that accepts but never speaks.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        }
    });

    let a = Discovery::start(config(vec![silent])).await.unwrap();

    // Long enough for the dial, the handshake timeout and at least one
    // sweep; the connection must never count as an edge and the silent
    // peer must never enter the node table.
    sleep(Duration::from_millis(10 * PERIOD_MS)).await;

    let stats = a.stats().await.unwrap();
    assert_eq!(stats.edges, 0);
    assert_eq!(stats.nodes, 0);
    // The timeout spans two ticks here, so at most two re-dial attempts
    // overlap; anything more means expired connections leak.
    assert!(stats.connections <= 2, "stale connections: {stats:?}");

    a.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hard_disconnect_keeps_node_entry() {
    let a = Discovery::start(config(vec![])).await.unwrap();
    let b = Discovery::start(config(vec![addr_of(&a)])).await.unwrap();

    wait_for(&a, 5, |s| s.edges == 1).await;
    wait_for(&a, 5, |s| s.nodes == 1).await;

    // Kill B without any goodbye.
    b.shutdown();

    // A reaps the connection but keeps B in its node table until the TTL
    // runs out.
    wait_for(&a, 5, |s| s.edges == 0).await;
    let stats = a.stats().await.unwrap();
    assert_eq!(stats.nodes, 1);

    a.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_publishers_both_observed() {
    let a = Discovery::start(config(vec![])).await.unwrap();
    let b = Discovery::start(config(vec![addr_of(&a)])).await.unwrap();
    let c = Discovery::start(config(vec![addr_of(&a), addr_of(&b)]))
        .await
        .unwrap();

    a.publish("svc", b"from-a".to_vec());
    b.publish("svc", b"from-b".to_vec());

    let (watch, mut rx) = watch_channel();
    c.discover("svc", 9, watch);

    let mut seen: Vec<(Uuid, Vec<u8>)> = Vec::new();
    while seen.len() < 2 {
        match next_event(&mut rx, 15).await {
            WatchEvent::Arrived { key_id, payload } => seen.push((key_id, payload)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert_ne!(seen[0].0, seen[1].0);
    let mut payloads: Vec<&[u8]> = seen.iter().map(|(_, p)| p.as_slice()).collect();
    payloads.sort();
    assert_eq!(payloads, vec![b"from-a".as_slice(), b"from-b".as_slice()]);

    // Both versions live in C's advertisement table.
    wait_for(&c, 5, |s| s.key_entries == 2).await;

    a.shutdown();
    b.shutdown();
    c.shutdown();
}
