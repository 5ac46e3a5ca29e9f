//! In-Memory Transport
//!
//! Implements the Transport port over tokio channels so whole meshes can
//! run inside one test process. Nodes join a shared `MemoryNetwork`.

use crate::domain::identity::NodeId;
use crate::domain::ports::{Channel, FrameSink, FrameStream, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// A set of in-process nodes that can dial each other.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: DashMap<NodeId, mpsc::UnboundedSender<Channel>>,
    /// Nodes whose dials never complete.
    blackholed: DashSet<NodeId>,
    frames: AtomicUsize,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and return its transport.
    pub fn endpoint(self: &Arc<Self>, id: impl Into<NodeId>) -> MemoryTransport {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(id.clone(), tx);
        MemoryTransport {
            id,
            network: Arc::clone(self),
            incoming: Mutex::new(rx),
        }
    }

    /// Make dials to `id` hang forever.
    pub fn blackhole(&self, id: &NodeId) {
        self.blackholed.insert(id.clone());
    }

    /// Remove a node; dials to it fail and its `accept` ends.
    pub fn unregister(&self, id: &NodeId) {
        self.listeners.remove(id);
    }

    /// Total frames sent over the network so far.
    pub fn frames_sent(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

/// One node's view of a `MemoryNetwork`.
pub struct MemoryTransport {
    id: NodeId,
    network: Arc<MemoryNetwork>,
    incoming: Mutex<mpsc::UnboundedReceiver<Channel>>,
}

/// Shared close flag of both directions of a link.
struct Link {
    closed: watch::Sender<bool>,
}

struct MemorySink {
    tx: mpsc::UnboundedSender<Bytes>,
    link: Arc<Link>,
    network: Arc<MemoryNetwork>,
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)?;
        self.network.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.link.closed.send_replace(true);
    }

    fn is_open(&self) -> bool {
        !*self.link.closed.borrow()
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    /// Frames sent before the link closed are still delivered.
    async fn next_frame(&mut self) -> Option<Bytes> {
        if let Ok(frame) = self.rx.try_recv() {
            return Some(frame);
        }
        if *self.closed.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = closed_signal(&mut self.closed) => self.rx.try_recv().ok(),
        }
    }
}

/// Resolves once the link is closed or every sink is gone.
async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

fn link(network: &Arc<MemoryNetwork>) -> [(MemorySink, MemoryStream); 2] {
    let (closed_tx, closed_rx) = watch::channel(false);
    let link = Arc::new(Link { closed: closed_tx });
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let sink = |tx| MemorySink {
        tx,
        link: Arc::clone(&link),
        network: Arc::clone(network),
    };
    [
        (
            sink(a_tx),
            MemoryStream {
                rx: b_rx,
                closed: closed_rx.clone(),
            },
        ),
        (
            sink(b_tx),
            MemoryStream {
                rx: a_rx,
                closed: closed_rx,
            },
        ),
    ]
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &NodeId {
        &self.id
    }

    async fn dial(&self, peer: &NodeId) -> Result<Channel, TransportError> {
        if self.network.blackholed.contains(peer) {
            std::future::pending::<()>().await;
        }

        let listener = self
            .network
            .listeners
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;

        let [(local_sink, local_stream), (remote_sink, remote_stream)] = link(&self.network);

        listener
            .send(Channel {
                peer: self.id.clone(),
                sink: Arc::new(remote_sink),
                stream: Box::new(remote_stream),
            })
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;

        Ok(Channel {
            peer: peer.clone(),
            sink: Arc::new(local_sink),
            stream: Box::new(local_stream),
        })
    }

    async fn accept(&self) -> Option<Channel> {
        self.incoming.lock().await.recv().await
    }
}
