//! inspection-sync node
//!
//! Composition root: wires storage, the QUIC transport, the mesh node and
//! the local API together.

use inspection_sync::adapters::inbound::ApiServer;
use inspection_sync::adapters::outbound::{MemoryStore, QuicConfig, QuicTransport, SqliteStore};
use inspection_sync::config::load_config;
use inspection_sync::domain::ports::PersistentStore;
use inspection_sync::infrastructure::shutdown_signal;
use inspection_sync::replication::MeshNode;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let node_id = cfg.node_id();
    tracing::info!(
        node = %node_id,
        identity = %cfg.identity,
        listen = %cfg.transport_listen_addr,
        "starting inspection-sync"
    );

    // ===== COMPOSITION ROOT =====

    // 1. Storage
    let store: Arc<dyn PersistentStore> = match &cfg.db_path {
        Some(path) => {
            tracing::info!(path = %path, "using sqlite store");
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            tracing::warn!("no database path configured, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    // 2. Transport
    let quic_config = cfg
        .address_book
        .iter()
        .fold(QuicConfig::new(node_id, cfg.transport_listen_addr), |c, (id, addr)| {
            c.peer(id.clone(), *addr)
        });
    let transport = Arc::new(QuicTransport::bind(quic_config)?);

    // 3. Mesh node
    let node = MeshNode::new(cfg.mesh_config(), transport.clone(), store).await?;
    for (id, _) in &cfg.address_book {
        node.add_known_peer(id.clone(), id.to_string()).await;
    }
    node.start();

    // 4. Node API
    if cfg.api_enabled {
        let server = ApiServer::new(cfg.api_listen_addr.clone(), node.clone());
        let shutdown = node.shutdown_controller().clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                tracing::error!(error = %e, "node API failed");
            }
        });
    }

    shutdown_signal(node.shutdown_controller().clone()).await;

    node.shutdown().await;
    transport.close();
    Ok(())
}
