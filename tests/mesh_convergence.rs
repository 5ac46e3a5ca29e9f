//! Integration tests for replication across several in-memory nodes
//!
//! These tests verify:
//! - Convergence of edits made on any node of a ring
//! - Loop safety: an update is applied once per node and traffic settles
//! - Self-removal invalidates the removed node's session exactly once
//! - Per-key last-writer-wins on field errors across the mesh

use inspection_sync::adapters::outbound::{MemoryNetwork, MemoryStore};
use inspection_sync::domain::entities::{ChatMessage, UserRecord};
use inspection_sync::replication::{ErrorReport, MeshConfig, MeshEvent, MeshNode};
use inspection_sync::derive_node_id;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

async fn start_node(network: &Arc<MemoryNetwork>, identity: &str) -> MeshNode {
    let config = MeshConfig::new(identity)
        .connect_timeout(Duration::from_millis(500))
        .bootstrap_delay(Duration::from_millis(10))
        .catchup_delay(Duration::from_millis(30));
    let node = MeshNode::new(
        config,
        Arc::new(network.endpoint(derive_node_id("oae", identity))),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();
    node.start();
    node
}

/// Three nodes wired in a ring: b dials a, c dials b, a dials c.
async fn ring(network: &Arc<MemoryNetwork>) -> (MeshNode, MeshNode, MeshNode) {
    let a = start_node(network, "a@example.com").await;
    let b = start_node(network, "b@example.com").await;
    let c = start_node(network, "c@example.com").await;

    assert!(b.connect(a.id()).await.unwrap());
    assert!(c.connect(b.id()).await.unwrap());
    // c may already have dialed a after learning it through peer discovery
    a.connect(c.id()).await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    for node in [&a, &b, &c] {
        while node.network_stats().await.connected_count < 2 {
            assert!(tokio::time::Instant::now() < deadline, "ring did not form");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    (a, b, c)
}

async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wait until no frame crosses the network for `quiet`.
async fn settle(network: &Arc<MemoryNetwork>, quiet: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    let mut last = network.frames_sent();
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(quiet).await;
        let now = network.frames_sent();
        if now == last {
            return true;
        }
        last = now;
    }
    false
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn shutdown_all(nodes: &[&MeshNode]) {
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_ring_converges_on_edits_from_every_node() {
    let network = MemoryNetwork::new();
    let (a, b, c) = ring(&network).await;

    a.update_work(fields(json!({"obra": "Ponte Rio Pardo"}))).await;
    b.send_message(ChatMessage {
        text: Some("checking pillar P3".into()),
        ..Default::default()
    })
    .await;
    c.report_error(ErrorReport {
        field_id: Some("extensao".into()),
        label: Some("Extensão".into()),
        ..Default::default()
    })
    .await;

    let converged = wait_until(|| {
        let (sa, sb, sc) = (a.snapshot(), b.snapshot(), c.snapshot());
        sa.same_content(&sb)
            && sb.same_content(&sc)
            && sa.mensagens.len() == 1
            && sa.errors.contains_key("extensao")
            && sa.work.fields.get("obra") == Some(&json!("Ponte Rio Pardo"))
    })
    .await;
    assert!(converged, "documents did not converge");

    shutdown_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_traffic_settles_after_convergence() {
    let network = MemoryNetwork::new();
    let (a, b, c) = ring(&network).await;

    for i in 0..5 {
        a.send_message(ChatMessage {
            id: format!("m{}", i),
            timestamp: 1_000 + i,
            ..Default::default()
        })
        .await;
    }

    assert!(wait_until(|| c.snapshot().mensagens.len() == 5).await);
    assert!(settle(&network, Duration::from_millis(200)).await, "frames kept flowing");

    // Every node holds each message once, in timestamp order.
    for node in [&a, &b, &c] {
        let ids: Vec<String> = node.snapshot().mensagens.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    shutdown_all(&[&a, &b, &c]).await;
}

fn document_changes(events: &mut tokio::sync::broadcast::Receiver<MeshEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MeshEvent::DocumentChanged { .. }) {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn test_update_is_applied_once_per_node() {
    let network = MemoryNetwork::new();
    let (a, b, c) = ring(&network).await;
    assert!(settle(&network, Duration::from_millis(100)).await);

    let mut b_events = b.subscribe();
    let mut c_events = c.subscribe();

    a.update_work(fields(json!({"km": 100}))).await;
    assert!(wait_until(|| {
        [&b, &c]
            .iter()
            .all(|node| node.snapshot().work.fields.get("km") == Some(&json!(100)))
    })
    .await);
    assert!(settle(&network, Duration::from_millis(100)).await);

    // Each neighbour accepts the edit once; the copies forwarded around the
    // triangle are recognised as already applied.
    assert_eq!(document_changes(&mut b_events), 1);
    assert_eq!(document_changes(&mut c_events), 1);

    shutdown_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_field_error_last_writer_wins_across_mesh() {
    let network = MemoryNetwork::new();
    let (a, b, c) = ring(&network).await;

    let km = |timestamp, label: &str| ErrorReport {
        field_id: Some("km".into()),
        timestamp,
        label: Some(label.to_string()),
        ..Default::default()
    };

    assert!(a.report_error(km(100, "first")).await);
    let spread = wait_until(|| {
        [&a, &b, &c]
            .iter()
            .all(|node| node.snapshot().errors.get("km").map(|e| e.timestamp) == Some(100))
    })
    .await;
    assert!(spread);

    // An older report is dropped wherever it lands.
    assert!(!b.report_error(km(90, "stale")).await);
    assert!(settle(&network, Duration::from_millis(100)).await);
    for node in [&a, &b, &c] {
        assert_eq!(node.snapshot().errors["km"].timestamp, 100);
    }

    // A newer one replaces it everywhere.
    assert!(c.report_error(km(150, "latest")).await);
    let replaced = wait_until(|| {
        [&a, &b, &c].iter().all(|node| {
            node.snapshot()
                .errors
                .get("km")
                .and_then(|e| e.label.clone())
                .as_deref()
                == Some("latest")
        })
    })
    .await;
    assert!(replaced);

    shutdown_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_self_removal_invalidates_session_once() {
    let network = MemoryNetwork::new();
    let (a, b, c) = ring(&network).await;
    let mut events = c.subscribe();

    assert!(
        a.add_user(UserRecord {
            email: "c@example.com".into(),
            name: "Carla".into(),
            role: "inspetor".into(),
            ..Default::default()
        })
        .await
    );
    assert!(wait_until(|| b.snapshot().users.contains_key("c@example.com")).await);

    assert!(a.remove_user("C@Example.com").await);
    assert!(wait_until(|| c.is_session_invalidated()).await);
    assert!(wait_until(|| !b.snapshot().users.contains_key("c@example.com")).await);
    assert!(settle(&network, Duration::from_millis(100)).await);

    let mut invalidations = 0;
    while let Ok(event) = events.try_recv() {
        if event == MeshEvent::SessionInvalidated {
            invalidations += 1;
        }
    }
    assert_eq!(invalidations, 1);

    shutdown_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_late_joiner_catches_up_through_bootstrap() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, "a@example.com").await;
    a.update_work(fields(json!({"km": 12}))).await;
    a.resolve_error("E-7").await;
    a.respond_to_message("m1", json!({"answer": "ok"})).await;

    let b = start_node(&network, "b@example.com").await;
    assert!(b.connect(a.id()).await.unwrap());

    assert!(wait_until(|| b.snapshot().same_content(&a.snapshot())).await);
    let doc = b.snapshot();
    assert_eq!(doc.work.fields.get("km"), Some(&json!(12)));
    assert_eq!(doc.completion_states.get("E-7"), Some(&true));
    assert_eq!(doc.message_responses.get("m1"), Some(&json!({"answer": "ok"})));

    shutdown_all(&[&a, &b]).await;
}

#[tokio::test]
async fn test_queued_work_is_flushed_on_connect() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, "a@example.com").await;
    a.publish_work(inspection_sync::WorkRecord {
        code: "OAE-042".into(),
        ..Default::default()
    })
    .await;
    assert_eq!(a.network_stats().await.pending_works, 1);

    let b = start_node(&network, "b@example.com").await;
    assert!(b.connect(a.id()).await.unwrap());

    assert!(wait_until(|| b.works().iter().any(|w| w.code == "OAE-042")).await);

    shutdown_all(&[&a, &b]).await;
}
