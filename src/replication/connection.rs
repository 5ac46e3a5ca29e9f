//! Connection Manager
//!
//! Owns the table of channels to peers and their lifecycle:
//! `Connecting -> Open -> Closed`, with `Error` reachable from `Connecting`
//! or `Open`. Frames are only sent on `Open` connections.
//!
//! When both nodes dial each other at once, the channel dialed by the node
//! with the smaller id survives on both sides.

use crate::domain::entities::{now_millis, Timestamp};
use crate::domain::identity::NodeId;
use crate::domain::ports::{Channel, FrameSink, FrameStream, Transport};
use crate::replication::envelope::{self, Envelope};
use crate::replication::error::MeshError;
use crate::replication::events::{EventBus, MeshEvent};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Error,
}

/// Public view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub peer: NodeId,
    pub state: ConnectionState,
    pub last_sync_at: Option<Timestamp>,
}

/// A channel that just reached `Open`. The caller drives its stream.
pub struct OpenedChannel {
    pub peer: NodeId,
    pub generation: u64,
    pub stream: Box<dyn FrameStream>,
}

struct ConnectionEntry {
    state: ConnectionState,
    generation: u64,
    last_sync_at: Option<Timestamp>,
    sink: Option<Arc<dyn FrameSink>>,
    reader: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionEntry {
    fn new(state: ConnectionState, generation: u64) -> Self {
        Self {
            state,
            generation,
            last_sync_at: None,
            sink: None,
            reader: None,
            tasks: Vec::new(),
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.state, ConnectionState::Connecting | ConnectionState::Open)
    }

    /// Detach everything tied to the current channel.
    fn teardown(&mut self, state: ConnectionState) -> Teardown {
        self.state = state;
        Teardown {
            sink: self.sink.take(),
            reader: self.reader.take(),
            tasks: std::mem::take(&mut self.tasks),
        }
    }
}

/// Resources released by a teardown, disposed of outside the table lock.
struct Teardown {
    sink: Option<Arc<dyn FrameSink>>,
    reader: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Teardown {
    async fn dispose(self, abort_reader: bool) {
        for task in self.tasks {
            task.abort();
        }
        if abort_reader {
            if let Some(reader) = self.reader {
                reader.abort();
            }
        }
        if let Some(sink) = self.sink {
            sink.close().await;
        }
    }
}

/// Table of live channels keyed by peer id.
pub struct ConnectionManager {
    local: NodeId,
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    connections: DashMap<NodeId, ConnectionEntry>,
    generations: AtomicU64,
    events: EventBus,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, connect_timeout: Duration, events: EventBus) -> Self {
        Self {
            local: transport.local_id().clone(),
            transport,
            connect_timeout,
            connections: DashMap::new(),
            generations: AtomicU64::new(1),
            events,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst)
    }

    /// Dial `peer`, bounded by the connect timeout.
    ///
    /// Returns `Ok(None)` when there is nothing to do: `peer` is this node,
    /// or a connection to it is already `Connecting` or `Open`.
    pub async fn connect(&self, peer: &NodeId) -> Result<Option<OpenedChannel>, MeshError> {
        if peer == &self.local {
            return Ok(None);
        }

        let generation = self.next_generation();
        {
            let mut entry = self
                .connections
                .entry(peer.clone())
                .or_insert_with(|| ConnectionEntry::new(ConnectionState::Closed, 0));
            if entry.is_live() {
                return Ok(None);
            }
            entry.state = ConnectionState::Connecting;
            entry.generation = generation;
        }

        tracing::debug!(%peer, "dialing");
        let dialed = tokio::time::timeout(self.connect_timeout, self.transport.dial(peer)).await;

        let channel = match dialed {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                self.fail(peer, generation, e.to_string()).await;
                return Err(MeshError::Channel(e));
            }
            Err(_) => {
                self.fail(peer, generation, "connect timeout".to_string()).await;
                return Err(MeshError::ConnectTimeout(peer.clone()));
            }
        };

        let still_ours = {
            match self.connections.get_mut(peer) {
                Some(mut entry)
                    if entry.generation == generation
                        && entry.state == ConnectionState::Connecting =>
                {
                    entry.state = ConnectionState::Open;
                    entry.sink = Some(Arc::clone(&channel.sink));
                    true
                }
                _ => false,
            }
        };

        if !still_ours {
            tracing::debug!(%peer, "dial superseded by another channel");
            channel.sink.close().await;
            return Ok(None);
        }

        tracing::info!(%peer, "connection open (outbound)");
        self.events.publish(MeshEvent::PeerConnected(peer.clone()));
        Ok(Some(OpenedChannel {
            peer: peer.clone(),
            generation,
            stream: channel.stream,
        }))
    }

    /// Register an inbound channel.
    ///
    /// Returns `None` when the channel lost a simultaneous-dial race and was closed.
    pub async fn accept(&self, channel: Channel) -> Option<OpenedChannel> {
        let peer = channel.peer.clone();
        if peer == self.local {
            channel.sink.close().await;
            return None;
        }

        let generation = self.next_generation();
        let replaced = {
            let mut entry = self
                .connections
                .entry(peer.clone())
                .or_insert_with(|| ConnectionEntry::new(ConnectionState::Closed, 0));

            let healthy = entry.sink.as_ref().map_or(true, |sink| sink.is_open());
            if entry.is_live() && healthy && self.local < peer {
                None
            } else {
                let was_open = entry.state == ConnectionState::Open;
                let old = entry.teardown(ConnectionState::Open);
                entry.generation = generation;
                entry.sink = Some(Arc::clone(&channel.sink));
                entry.last_sync_at = None;
                Some((old, was_open))
            }
        };

        let Some((old, was_open)) = replaced else {
            tracing::debug!(%peer, "rejecting inbound channel, own dial wins");
            channel.sink.close().await;
            return None;
        };
        old.dispose(true).await;

        tracing::info!(%peer, "connection open (inbound)");
        if !was_open {
            self.events.publish(MeshEvent::PeerConnected(peer.clone()));
        }
        Some(OpenedChannel {
            peer,
            generation,
            stream: channel.stream,
        })
    }

    /// Attach the reader task of a connection. Aborted if the connection moved on.
    pub fn attach_reader(&self, peer: &NodeId, generation: u64, handle: JoinHandle<()>) {
        match self.connections.get_mut(peer) {
            Some(mut entry) if entry.generation == generation && entry.is_live() => {
                entry.reader = Some(handle);
            }
            _ => handle.abort(),
        }
    }

    /// Attach a task cancelled together with the connection.
    pub fn attach_task(&self, peer: &NodeId, generation: u64, handle: JoinHandle<()>) {
        match self.connections.get_mut(peer) {
            Some(mut entry) if entry.generation == generation && entry.is_live() => {
                entry.tasks.retain(|task| !task.is_finished());
                entry.tasks.push(handle);
            }
            _ => handle.abort(),
        }
    }

    /// Called by the reader task once the stream ended.
    pub async fn stream_ended(&self, peer: &NodeId, generation: u64) {
        let torn_down = match self.connections.get_mut(peer) {
            Some(mut entry) if entry.generation == generation && entry.is_live() => {
                Some(entry.teardown(ConnectionState::Closed))
            }
            _ => None,
        };
        if let Some(teardown) = torn_down {
            teardown.dispose(false).await;
            tracing::info!(%peer, "connection closed");
            self.events.publish(MeshEvent::PeerDisconnected(peer.clone()));
        }
    }

    async fn fail(&self, peer: &NodeId, generation: u64, reason: String) {
        let torn_down = match self.connections.get_mut(peer) {
            Some(mut entry) if entry.generation == generation => {
                Some(entry.teardown(ConnectionState::Error))
            }
            _ => None,
        };
        if let Some(teardown) = torn_down {
            teardown.dispose(true).await;
            tracing::warn!(%peer, %reason, "connection error");
            self.events.publish(MeshEvent::ConnectionError {
                peer: peer.clone(),
                reason,
            });
        }
    }

    /// Close the connection to `peer`. Idempotent.
    pub async fn close(&self, peer: &NodeId) {
        let torn_down = match self.connections.get_mut(peer) {
            Some(mut entry) if entry.is_live() => {
                let was_open = entry.state == ConnectionState::Open;
                Some((entry.teardown(ConnectionState::Closed), was_open))
            }
            _ => None,
        };
        if let Some((teardown, was_open)) = torn_down {
            teardown.dispose(true).await;
            tracing::info!(%peer, "connection closed locally");
            if was_open {
                self.events.publish(MeshEvent::PeerDisconnected(peer.clone()));
            }
        }
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        let peers: Vec<NodeId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            self.close(&peer).await;
        }
    }

    /// Forget a peer entirely, closing its connection first.
    pub async fn forget(&self, peer: &NodeId) {
        self.close(peer).await;
        self.connections.remove(peer);
    }

    fn open_sink(&self, peer: &NodeId) -> Option<Arc<dyn FrameSink>> {
        self.connections.get(peer).and_then(|entry| {
            if entry.state == ConnectionState::Open {
                entry.sink.clone()
            } else {
                None
            }
        })
    }

    /// Send an envelope to every open connection except `exclude`.
    ///
    /// Per-connection failures are logged and skipped. Returns how many sends succeeded.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: Option<&NodeId>) -> usize {
        let frame = match envelope::encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(kind = %envelope.kind, error = %e, "failed to encode envelope");
                return 0;
            }
        };

        let targets: Vec<(NodeId, Arc<dyn FrameSink>)> = self
            .connections
            .iter()
            .filter(|entry| Some(entry.key()) != exclude)
            .filter(|entry| entry.state == ConnectionState::Open)
            .filter_map(|entry| entry.sink.clone().map(|sink| (entry.key().clone(), sink)))
            .collect();

        let mut sent = 0;
        for (peer, sink) in targets {
            match sink.send(frame.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(%peer, kind = %envelope.kind, error = %e, "broadcast send failed")
                }
            }
        }
        tracing::debug!(kind = %envelope.kind, sent, "broadcast");
        sent
    }

    /// Send an envelope to one peer.
    pub async fn send_to(&self, peer: &NodeId, envelope: &Envelope) -> Result<(), MeshError> {
        let sink = self
            .open_sink(peer)
            .ok_or_else(|| MeshError::NotConnected(peer.clone()))?;
        let frame = envelope::encode(envelope)?;
        sink.send(frame).await.map_err(|e| {
            tracing::warn!(%peer, kind = %envelope.kind, error = %e, "send failed");
            MeshError::Channel(e)
        })
    }

    /// Record that a frame was handled for `peer`.
    pub fn touch(&self, peer: &NodeId) {
        if let Some(mut entry) = self.connections.get_mut(peer) {
            entry.last_sync_at = Some(now_millis());
        }
    }

    pub fn state(&self, peer: &NodeId) -> Option<ConnectionState> {
        self.connections.get(peer).map(|entry| entry.state)
    }

    pub fn is_open(&self, peer: &NodeId) -> bool {
        self.state(peer) == Some(ConnectionState::Open)
    }

    /// Ids of every `Open` connection, sorted.
    pub fn open_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .connections
            .iter()
            .filter(|entry| entry.state == ConnectionState::Open)
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn open_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.state == ConnectionState::Open)
            .count()
    }

    /// Every tracked connection, sorted by peer id.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| ConnectionInfo {
                peer: entry.key().clone(),
                state: entry.state,
                last_sync_at: entry.last_sync_at,
            })
            .collect();
        infos.sort_by(|a, b| a.peer.cmp(&b.peer));
        infos
    }
}
