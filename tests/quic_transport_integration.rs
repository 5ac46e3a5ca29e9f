//! Integration tests for the QUIC peer transport
//!
//! Binds real endpoints on the loopback interface and checks that:
//! - the hello frame identifies the dialer to the acceptor
//! - frames flow in both directions
//! - an acceptor can dial back a peer that dialed it
//! - two mesh nodes synchronize over QUIC

use bytes::Bytes;
use inspection_sync::adapters::outbound::{MemoryStore, QuicConfig, QuicTransport};
use inspection_sync::domain::entities::ChatMessage;
use inspection_sync::domain::ports::Transport;
use inspection_sync::replication::{MeshConfig, MeshNode};
use inspection_sync::{derive_node_id, NodeId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn test_frames_flow_both_ways() {
    let a_id = NodeId::new("oae-a");
    let b_id = NodeId::new("oae-b");

    let a = QuicTransport::bind(QuicConfig::new(a_id.clone(), loopback())).unwrap();
    let b = QuicTransport::bind(
        QuicConfig::new(b_id.clone(), loopback()).peer(a_id.clone(), a.local_addr().unwrap()),
    )
    .unwrap();

    let outbound = tokio::time::timeout(Duration::from_secs(5), b.dial(&a_id))
        .await
        .expect("dial timed out")
        .unwrap();
    assert_eq!(outbound.peer, a_id);

    let mut inbound = tokio::time::timeout(Duration::from_secs(5), a.accept())
        .await
        .expect("accept timed out")
        .expect("endpoint closed");
    assert_eq!(inbound.peer, b_id);

    outbound.sink.send(Bytes::from_static(b"ping")).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), inbound.stream.next_frame())
        .await
        .unwrap();
    assert_eq!(frame, Some(Bytes::from_static(b"ping")));

    let mut outbound_stream = outbound.stream;
    inbound.sink.send(Bytes::from_static(b"pong")).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), outbound_stream.next_frame())
        .await
        .unwrap();
    assert_eq!(frame, Some(Bytes::from_static(b"pong")));

    a.close();
    b.close();
}

#[tokio::test]
async fn test_acceptor_can_dial_back_inbound_peer() {
    let a_id = NodeId::new("oae-a");
    let b_id = NodeId::new("oae-b");

    // Only b knows where a listens.
    let a = QuicTransport::bind(QuicConfig::new(a_id.clone(), loopback())).unwrap();
    let b = QuicTransport::bind(
        QuicConfig::new(b_id.clone(), loopback()).peer(a_id.clone(), a.local_addr().unwrap()),
    )
    .unwrap();
    assert!(a.peer_addr(&b_id).is_none());

    let _outbound = b.dial(&a_id).await.unwrap();
    let inbound = tokio::time::timeout(Duration::from_secs(5), a.accept())
        .await
        .expect("accept timed out")
        .expect("endpoint closed");
    assert_eq!(inbound.peer, b_id);
    assert_eq!(a.peer_addr(&b_id).map(|addr| addr.port()), Some(b.local_addr().unwrap().port()));

    let dialed_back = tokio::time::timeout(Duration::from_secs(5), a.dial(&b_id))
        .await
        .expect("dial timed out")
        .unwrap();
    let mut reverse = tokio::time::timeout(Duration::from_secs(5), b.accept())
        .await
        .expect("accept timed out")
        .expect("endpoint closed");
    assert_eq!(reverse.peer, a_id);

    dialed_back.sink.send(Bytes::from_static(b"back")).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), reverse.stream.next_frame())
        .await
        .unwrap();
    assert_eq!(frame, Some(Bytes::from_static(b"back")));

    a.close();
    b.close();
}

#[tokio::test]
async fn test_closed_sink_reports_closed() {
    let a_id = NodeId::new("oae-a");
    let a = QuicTransport::bind(QuicConfig::new(a_id.clone(), loopback())).unwrap();
    let b = QuicTransport::bind(
        QuicConfig::new(NodeId::new("oae-b"), loopback()).peer(a_id.clone(), a.local_addr().unwrap()),
    )
    .unwrap();

    let channel = b.dial(&a_id).await.unwrap();
    assert!(channel.sink.is_open());
    channel.sink.close().await;
    assert!(!channel.sink.is_open());
    assert!(channel.sink.send(Bytes::from_static(b"late")).await.is_err());

    a.close();
    b.close();
}

#[tokio::test]
async fn test_mesh_nodes_sync_over_quic() {
    let a_id = derive_node_id("oae", "a@example.com");
    let b_id = derive_node_id("oae", "b@example.com");

    let a_transport = Arc::new(QuicTransport::bind(QuicConfig::new(a_id.clone(), loopback())).unwrap());
    let b_transport = Arc::new(
        QuicTransport::bind(
            QuicConfig::new(b_id, loopback()).peer(a_id.clone(), a_transport.local_addr().unwrap()),
        )
        .unwrap(),
    );

    let config = |identity: &str| {
        MeshConfig::new(identity)
            .bootstrap_delay(Duration::from_millis(20))
            .catchup_delay(Duration::from_millis(50))
    };
    let a = MeshNode::new(config("a@example.com"), a_transport.clone(), Arc::new(MemoryStore::new()))
        .await
        .unwrap();
    let b = MeshNode::new(config("b@example.com"), b_transport.clone(), Arc::new(MemoryStore::new()))
        .await
        .unwrap();
    a.start();
    b.start();

    a.send_message(ChatMessage {
        id: "before-connect".into(),
        timestamp: 1,
        ..Default::default()
    })
    .await;
    assert!(b.connect(&a_id).await.unwrap());

    // Bootstrap brings b up to date, then live updates flow back to a.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while b.snapshot().mensagens.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(b.snapshot().mensagens[0].id, "before-connect");

    b.send_message(ChatMessage {
        id: "after-connect".into(),
        timestamp: 2,
        ..Default::default()
    })
    .await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.snapshot().mensagens.len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let ids: Vec<String> = a.snapshot().mensagens.into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["before-connect", "after-connect"]);

    a.shutdown().await;
    b.shutdown().await;
    a_transport.close();
    b_transport.close();
}
