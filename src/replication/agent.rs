//! Mesh Node
//!
//! Orchestrates the replication components (connections, router, merge,
//! propagation, bootstrap) behind one handle. A node:
//!
//! - accepts inbound channels and dials its known peers, retrying on a timer
//! - merges every inbound update into the shared document
//! - re-broadcasts accepted updates to every other peer
//! - broadcasts local edits to all open connections

use crate::application::DocumentService;
use crate::domain::entities::{
    now_millis, ChatMessage, DocumentFragment, SharedDocument, UserRecord, WorkMetadata,
    WorkRecord,
};
use crate::domain::identity::{derive_node_id, normalize_identity, Node, NodeId};
use crate::domain::ports::{KnownPeer, PersistentStore, Transport};
use crate::domain::services::UserRemoval;
use crate::infrastructure::shutdown::ShutdownController;
use crate::replication::bootstrap::Bootstrapper;
use crate::replication::config::{ConfigError, MeshConfig};
use crate::replication::connection::{ConnectionInfo, ConnectionManager, OpenedChannel};
use crate::replication::envelope::{Envelope, ErrorReport, Message, TypingNotice};
use crate::replication::error::MeshError;
use crate::replication::events::{EventBus, MeshEvent};
use crate::replication::peers::KnownPeers;
use crate::replication::pending::PendingQueue;
use crate::replication::propagation::propagate;
use crate::replication::router::{self, MessageHandler};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Counters and ids describing a node's view of the mesh.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub local_id: NodeId,
    pub identity: String,
    pub display_name: String,
    pub known_count: usize,
    pub connected_count: usize,
    pub known_peers: Vec<KnownPeer>,
    pub connected_peers: Vec<NodeId>,
    pub connections: Vec<ConnectionInfo>,
    pub pending_works: usize,
}

struct MeshInner {
    config: MeshConfig,
    node: Node,
    documents: Arc<DocumentService>,
    connections: Arc<ConnectionManager>,
    known: Arc<KnownPeers>,
    pending: Arc<PendingQueue>,
    bootstrapper: Bootstrapper,
    events: EventBus,
    shutdown: ShutdownController,
    /// Set once a `user_removed` for the local user was handled.
    self_removed: AtomicBool,
}

/// Handle to a running mesh node. Cheap to clone.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<MeshInner>,
}

impl MeshNode {
    /// Build a node from its configuration, transport and store.
    ///
    /// The transport must already be bound to the id derived from the identity.
    pub async fn new(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PersistentStore>,
    ) -> Result<Self, MeshError> {
        config.validate()?;

        let node = Node::new(&config.peer_prefix, &config.identity, config.display_name.clone());
        if transport.local_id() != &node.id {
            return Err(ConfigError::TransportIdentity {
                expected: node.id.to_string(),
                actual: transport.local_id().to_string(),
            }
            .into());
        }

        let events = EventBus::new(config.event_capacity);
        let connections = Arc::new(ConnectionManager::new(
            transport,
            config.connect_timeout,
            events.clone(),
        ));
        let documents = Arc::new(DocumentService::load(node.clone(), store.clone()).await?);
        let known = Arc::new(KnownPeers::load(node.id.clone(), store.clone()).await?);
        let pending = Arc::new(PendingQueue::load(store, config.pending_capacity).await?);
        let bootstrapper = Bootstrapper::new(
            documents.clone(),
            connections.clone(),
            known.clone(),
            pending.clone(),
            config.bootstrap_delay,
            config.catchup_delay,
        );

        tracing::info!(node = %node.id, name = %node.display_name, "mesh node created");

        Ok(Self {
            inner: Arc::new(MeshInner {
                config,
                node,
                documents,
                connections,
                known,
                pending,
                bootstrapper,
                events,
                shutdown: ShutdownController::new(),
                self_removed: AtomicBool::new(false),
            }),
        })
    }

    pub fn node(&self) -> &Node {
        &self.inner.node
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.node.id
    }

    /// The id a peer with `identity` listens on, under this node's prefix.
    pub fn peer_id_for(&self, identity: &str) -> NodeId {
        derive_node_id(&self.inner.config.peer_prefix, identity)
    }

    pub fn documents(&self) -> &Arc<DocumentService> {
        &self.inner.documents
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.inner.shutdown
    }

    /// Whether the local user was removed from the directory by a peer.
    pub fn is_session_invalidated(&self) -> bool {
        self.inner.self_removed.load(Ordering::SeqCst)
    }

    /// Start the accept, reconnect and flush loops.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(&self) {
        tracing::info!(
            node = %self.id(),
            known = self.inner.known.len(),
            "starting mesh node"
        );
        self.start_accept_loop();
        self.start_reconnect_loop();
        self.start_flush_loop();
    }

    /// Stop background loops and close every connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.shutdown();
        self.inner.connections.close_all().await;
        self.inner.shutdown.wait_for_drain(Duration::from_secs(5)).await;
        tracing::info!(node = %self.id(), "mesh node stopped");
    }

    fn start_accept_loop(&self) {
        let node = self.clone();
        let guard = self.inner.shutdown.task_guard();
        tokio::spawn(async move {
            let _guard = guard;
            let transport = Arc::clone(node.inner.connections.transport());
            loop {
                let channel = tokio::select! {
                    _ = node.inner.shutdown.cancelled() => break,
                    channel = transport.accept() => channel,
                };
                let Some(channel) = channel else {
                    tracing::info!("transport stopped accepting");
                    break;
                };

                node.inner
                    .known
                    .add(KnownPeer::new(channel.peer.clone(), ""))
                    .await;
                if let Some(opened) = node.inner.connections.accept(channel).await {
                    node.on_open(opened);
                }
            }
        });
    }

    fn start_reconnect_loop(&self) {
        let node = self.clone();
        let guard = self.inner.shutdown.task_guard();
        let interval = self.inner.config.reconnect_interval;
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                let opened = tokio::select! {
                    _ = node.inner.shutdown.cancelled() => break,
                    opened = node.connect_known_peers() => opened,
                };
                if opened > 0 {
                    tracing::debug!(opened, "reconnect pass");
                }

                let jitter = {
                    let max = (interval.as_millis() as u64 / 10).max(1);
                    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
                };
                tokio::select! {
                    _ = node.inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval + jitter) => {}
                }
            }
        });
    }

    fn start_flush_loop(&self) {
        let node = self.clone();
        let guard = self.inner.shutdown.task_guard();
        let period = self.inner.config.flush_interval;
        tokio::spawn(async move {
            let _guard = guard;
            let mut timer = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = node.inner.shutdown.cancelled() => break,
                    _ = timer.tick() => {
                        node.inner.pending.flush(&node.inner.connections, None).await;
                    }
                }
            }
        });
    }

    /// Drive a freshly opened channel: spawn its reader and bootstrap it.
    fn on_open(&self, opened: OpenedChannel) {
        let OpenedChannel {
            peer,
            generation,
            mut stream,
        } = opened;

        let node = self.clone();
        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next_frame().await {
                router::dispatch(&node.inner.connections, &node, &reader_peer, &frame).await;
            }
            node.inner
                .connections
                .stream_ended(&reader_peer, generation)
                .await;
        });
        self.inner.connections.attach_reader(&peer, generation, reader);
        self.inner.bootstrapper.start(&peer, generation);
    }

    /// Dial a peer. Returns `false` when a connection already existed.
    pub async fn connect(&self, peer: &NodeId) -> Result<bool, MeshError> {
        match self.inner.connections.connect(peer).await? {
            Some(opened) => {
                self.on_open(opened);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dial every known peer without an open connection, concurrently.
    ///
    /// Returns how many connections were opened.
    pub async fn connect_known_peers(&self) -> usize {
        let mut dials = JoinSet::new();
        for peer in self.inner.known.ids() {
            if self.inner.connections.is_open(&peer) {
                continue;
            }
            let node = self.clone();
            dials.spawn(async move {
                match node.connect(&peer).await {
                    Ok(opened) => opened,
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "known peer unreachable");
                        false
                    }
                }
            });
        }

        let mut opened = 0;
        while let Some(result) = dials.join_next().await {
            if matches!(result, Ok(true)) {
                opened += 1;
            }
        }
        opened
    }

    fn dial_in_background(&self, peers: Vec<NodeId>) {
        for peer in peers {
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.connect(&peer).await {
                    tracing::debug!(%peer, error = %e, "dial failed");
                }
            });
        }
    }

    /// Remember a peer and dial it. Returns whether it was new.
    ///
    /// An unreachable peer is still remembered and retried by the reconnect loop.
    pub async fn add_known_peer(&self, id: NodeId, display_name: impl Into<String>) -> bool {
        let added = self
            .inner
            .known
            .add(KnownPeer::new(id.clone(), display_name))
            .await;
        if let Err(e) = self.connect(&id).await {
            tracing::info!(peer = %id, error = %e, "added peer not reachable yet");
        }
        added
    }

    /// Forget a peer and close its connection.
    pub async fn remove_known_peer(&self, id: &NodeId) -> bool {
        let removed = self.inner.known.remove(id).await;
        self.inner.connections.forget(id).await;
        removed
    }

    /// Derive peer ids from the user directory and add the unknown ones.
    pub async fn discover_from_users(&self) -> Vec<NodeId> {
        let mut added = Vec::new();
        for user in self.inner.documents.users() {
            let id = self.peer_id_for(&user.email);
            if id == self.inner.node.id {
                continue;
            }
            if self.inner.known.add(KnownPeer::new(id.clone(), user.name)).await {
                added.push(id);
            }
        }

        if !added.is_empty() {
            tracing::info!(count = added.len(), "peers discovered from users");
            self.inner.events.publish(MeshEvent::PeersDiscovered {
                peers: added.clone(),
            });
            self.dial_in_background(added.clone());
        }
        added
    }

    async fn broadcast(&self, message: Message) -> usize {
        let envelope = Envelope::new(&message, self.id());
        self.inner.connections.broadcast(&envelope, None).await
    }

    /// Post a chat message. Missing id, timestamp and author are filled in.
    pub async fn send_message(&self, mut message: ChatMessage) -> ChatMessage {
        if message.id.is_empty() {
            message.id = uuid::Uuid::new_v4().to_string();
        }
        if message.timestamp == 0 {
            message.timestamp = now_millis();
        }
        if message.author.is_none() {
            message.author = Some(self.inner.node.display_name.clone());
        }

        if self.inner.documents.apply_message(&message, self.id()).await {
            self.broadcast(Message::Message(message.clone())).await;
        }
        message
    }

    /// Record an error on a field or an element and broadcast it.
    ///
    /// Returns `false` when the report names no target or changed nothing.
    pub async fn report_error(&self, mut report: ErrorReport) -> bool {
        if report.timestamp == 0 {
            report.timestamp = now_millis();
        }
        let documents = &self.inner.documents;
        let accepted = if let Some((field_id, record)) = report.field_error() {
            documents.apply_field_error(&field_id, &record, self.id()).await
        } else if let Some(entry) = report.element_error() {
            documents.apply_element_error(&entry, self.id()).await
        } else {
            tracing::warn!("error report without field or element id");
            false
        };

        if accepted {
            self.broadcast(Message::ErrorAdded(report)).await;
        }
        accepted
    }

    /// Mark an error resolved everywhere.
    pub async fn resolve_error(&self, error_id: &str) -> bool {
        let changed = self.inner.documents.resolve_error(error_id, self.id()).await;
        if changed {
            self.broadcast(Message::ErrorResolved {
                error_id: error_id.to_string(),
            })
            .await;
        }
        changed
    }

    /// Record a response to a message and push it as a partial state update.
    pub async fn respond_to_message(&self, key: &str, response: Value) -> bool {
        let changed = self
            .inner
            .documents
            .respond_to_message(key, response.clone(), self.id())
            .await;
        if changed {
            let mut responses = std::collections::BTreeMap::new();
            responses.insert(key.to_string(), response);
            self.broadcast(Message::StateUpdate(DocumentFragment {
                message_responses: Some(responses),
                ..Default::default()
            }))
            .await;
        }
        changed
    }

    /// Tell direct peers whether the local user is typing.
    pub async fn set_typing(&self, is_typing: bool) -> usize {
        self.broadcast(Message::Typing(TypingNotice {
            is_typing,
            user: Some(self.inner.node.display_name.clone()),
            user_id: Some(self.id().clone()),
            timestamp: now_millis(),
        }))
        .await
    }

    /// Replace the work metadata with a local edit and push it.
    pub async fn update_work(&self, fields: Map<String, Value>) -> WorkMetadata {
        let work = self.inner.documents.edit_work(fields).await;
        self.broadcast(Message::StateUpdate(DocumentFragment {
            work: Some(work.clone()),
            ..Default::default()
        }))
        .await;
        work
    }

    /// Publish a work to the catalogue of every peer.
    ///
    /// Queued for later when no peer is connected.
    pub async fn publish_work(&self, record: WorkRecord) -> WorkRecord {
        let record = self.inner.documents.publish_work(record).await;
        let sent = self.broadcast(Message::WorkUpdated(record.clone())).await;
        if sent == 0 {
            self.inner.pending.enqueue(record.clone()).await;
        }
        record
    }

    pub fn works(&self) -> Vec<WorkRecord> {
        self.inner.documents.works()
    }

    fn stamp_user(&self, user: &mut UserRecord) {
        let previous = self.inner.documents.user_version(&user.email);
        let now = now_millis().max(previous + 1);
        if user.created_at.is_none() {
            user.created_at = Some(now);
        }
        user.updated_at = Some(now);
    }

    /// Add a user to the directory.
    pub async fn add_user(&self, mut user: UserRecord) -> bool {
        self.stamp_user(&mut user);
        let accepted = self.inner.documents.apply_user(&user, self.id()).await;
        if accepted {
            self.broadcast(Message::UserAdded(user)).await;
        }
        accepted
    }

    /// Replace a user's record with a newer version.
    pub async fn update_user(&self, mut user: UserRecord) -> bool {
        self.stamp_user(&mut user);
        let accepted = self.inner.documents.apply_user(&user, self.id()).await;
        if accepted {
            self.broadcast(Message::UserUpdated(user)).await;
        }
        accepted
    }

    /// Remove a user from the directory.
    pub async fn remove_user(&self, email: &str) -> bool {
        let removed = self.inner.documents.delete_user(email).await;
        if removed {
            self.broadcast(Message::UserRemoved {
                email: normalize_identity(email),
            })
            .await;
        }
        removed
    }

    /// Push the whole user directory to every peer.
    pub async fn sync_users(&self) -> usize {
        let users = self.inner.documents.users();
        self.broadcast(Message::UsersSync { users }).await
    }

    /// Ask every peer for its user directory.
    pub async fn request_users_sync(&self) -> usize {
        self.broadcast(Message::RequestUsersSync).await
    }

    /// Push the full document to every peer.
    pub async fn broadcast_state(&self) -> usize {
        let fragment = self.inner.documents.fragment();
        self.broadcast(Message::StateUpdate(fragment)).await
    }

    /// Ask every peer for its full document.
    pub async fn request_sync(&self) -> usize {
        self.broadcast(Message::SyncRequest).await
    }

    pub fn snapshot(&self) -> SharedDocument {
        self.inner.documents.snapshot()
    }

    pub async fn network_stats(&self) -> NetworkStats {
        let known_peers = self.inner.known.list();
        let connected_peers = self.inner.connections.open_peers();
        NetworkStats {
            local_id: self.id().clone(),
            identity: self.inner.node.identity.clone(),
            display_name: self.inner.node.display_name.clone(),
            known_count: known_peers.len(),
            connected_count: connected_peers.len(),
            known_peers,
            connected_peers,
            connections: self.inner.connections.snapshot(),
            pending_works: self.inner.pending.len().await,
        }
    }

    async fn reply(&self, to: &NodeId, message: Message) {
        let envelope = Envelope::new(&message, self.id());
        if let Err(e) = self.inner.connections.send_to(to, &envelope).await {
            tracing::warn!(peer = %to, kind = %envelope.kind, error = %e, "reply failed");
        }
    }

    /// Apply one remote message. Returns whether it changed local state.
    async fn apply_remote(&self, from: &NodeId, message: Message) -> bool {
        let inner = &self.inner;
        let documents = &inner.documents;

        match message {
            Message::StateUpdate(fragment) => {
                let report = documents.apply_fragment(&fragment, from).await;
                if report.changed() {
                    tracing::debug!(%from, items = report.total_items(), work = report.work, "state merged");
                    inner.events.publish(MeshEvent::DocumentChanged {
                        from: from.clone(),
                        kind: "state_update".into(),
                    });
                }
                report.changed()
            }
            Message::Message(message) => {
                let accepted = documents.apply_message(&message, from).await;
                if accepted {
                    inner.events.publish(MeshEvent::DocumentChanged {
                        from: from.clone(),
                        kind: "message".into(),
                    });
                }
                accepted
            }
            Message::ErrorAdded(report) => {
                let accepted = if let Some((field_id, record)) = report.field_error() {
                    documents.apply_field_error(&field_id, &record, from).await
                } else if let Some(entry) = report.element_error() {
                    documents.apply_element_error(&entry, from).await
                } else {
                    tracing::warn!(%from, "error_added without field or element id");
                    false
                };
                if accepted {
                    inner.events.publish(MeshEvent::DocumentChanged {
                        from: from.clone(),
                        kind: "error_added".into(),
                    });
                }
                accepted
            }
            Message::ErrorResolved { error_id } => {
                let accepted = documents.resolve_error(&error_id, from).await;
                if accepted {
                    inner.events.publish(MeshEvent::DocumentChanged {
                        from: from.clone(),
                        kind: "error_resolved".into(),
                    });
                }
                accepted
            }
            Message::Typing(mut notice) => {
                if notice.user.is_none() {
                    notice.user = Some(inner.known.display_name(from));
                }
                inner.events.publish(MeshEvent::Typing {
                    from: from.clone(),
                    notice,
                });
                false
            }
            Message::SyncRequest => {
                self.reply(from, Message::StateUpdate(documents.fragment())).await;
                false
            }
            Message::UsersSync { users } => {
                let merged = documents.apply_users(&users, from).await;
                if merged > 0 {
                    tracing::debug!(%from, merged, "users merged");
                    inner.events.publish(MeshEvent::UsersChanged { from: from.clone() });
                    if let Some(me) = users.iter().find(|u| inner.node.is_identity(&u.email)) {
                        if documents.local_user() == *me {
                            inner.events.publish(MeshEvent::ProfileUpdated(me.clone()));
                        }
                    }
                }
                merged > 0
            }
            Message::UserAdded(user) => {
                let accepted = documents.apply_user(&user, from).await;
                if accepted {
                    inner.events.publish(MeshEvent::UsersChanged { from: from.clone() });
                }
                accepted
            }
            Message::UserUpdated(user) => {
                let accepted = documents.apply_user(&user, from).await;
                if accepted {
                    inner.events.publish(MeshEvent::UsersChanged { from: from.clone() });
                    if inner.node.is_identity(&user.email) {
                        inner.events.publish(MeshEvent::ProfileUpdated(user));
                    }
                }
                accepted
            }
            Message::UserRemoved { email } => match documents.remove_user(&email).await {
                UserRemoval::Removed => {
                    inner.events.publish(MeshEvent::UsersChanged { from: from.clone() });
                    true
                }
                UserRemoval::NotFound => false,
                UserRemoval::SelfRemoved => {
                    // propagated once, then the session ends
                    if inner.self_removed.swap(true, Ordering::SeqCst) {
                        false
                    } else {
                        tracing::warn!(%from, "local user removed from directory");
                        true
                    }
                }
            },
            Message::RequestUsersSync => {
                let users = documents.users();
                self.reply(from, Message::UsersSync { users }).await;
                false
            }
            Message::WorkUpdated(work) => {
                let code = work.code.clone();
                let accepted = documents.apply_work_record(&work).await;
                if accepted {
                    inner.events.publish(MeshEvent::WorkCatalogChanged {
                        from: from.clone(),
                        code,
                    });
                }
                accepted
            }
            Message::PeerDiscovery { peers } => {
                let mut discovered = Vec::new();
                for peer in peers {
                    if peer == inner.node.id || inner.known.contains(&peer) {
                        continue;
                    }
                    if inner.known.add(KnownPeer::new(peer.clone(), "")).await {
                        discovered.push(peer);
                    }
                }
                if !discovered.is_empty() {
                    tracing::info!(%from, count = discovered.len(), "peers discovered");
                    inner.events.publish(MeshEvent::PeersDiscovered {
                        peers: discovered.clone(),
                    });
                    self.dial_in_background(discovered);
                }
                false
            }
            Message::UserLogin(user) => {
                inner
                    .known
                    .add(KnownPeer::new(from.clone(), user.name.clone()))
                    .await;
                inner.events.publish(MeshEvent::UserLogin {
                    from: from.clone(),
                    user,
                });
                false
            }
            Message::RequestWorks => {
                let works = documents.works();
                self.reply(from, Message::WorksList { works }).await;
                false
            }
            Message::WorksList { works } => {
                for work in works {
                    if documents.apply_work_record(&work).await {
                        inner.events.publish(MeshEvent::WorkCatalogChanged {
                            from: from.clone(),
                            code: work.code,
                        });
                    }
                }
                false
            }
            Message::Unknown(_) => false,
        }
    }
}

#[async_trait]
impl MessageHandler for MeshNode {
    async fn handle(&self, from: &NodeId, envelope: &Envelope, message: Message) {
        let propagated = message.is_propagated();
        let self_removal = matches!(&message, Message::UserRemoved { email } if self.inner.node.is_identity(email));

        let accepted = self.apply_remote(from, message).await;
        if accepted && propagated {
            propagate(&self.inner.connections, envelope, from).await;
        }
        if accepted && self_removal {
            self.inner.events.publish(MeshEvent::SessionInvalidated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryNetwork, MemoryStore};
    use crate::domain::entities::FieldError;

    fn config(identity: &str) -> MeshConfig {
        MeshConfig::new(identity)
            .connect_timeout(Duration::from_millis(200))
            .bootstrap_delay(Duration::from_millis(10))
            .catchup_delay(Duration::from_millis(20))
    }

    async fn node(network: &Arc<MemoryNetwork>, identity: &str) -> MeshNode {
        let id = derive_node_id("oae", identity);
        MeshNode::new(
            config(identity),
            Arc::new(network.endpoint(id)),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_transport_must_match_identity() {
        let network = MemoryNetwork::new();
        let result = MeshNode::new(
            config("a@example.com"),
            Arc::new(network.endpoint("oae-wrong")),
            Arc::new(MemoryStore::new()),
        )
        .await;
        assert!(matches!(
            result,
            Err(MeshError::Config(ConfigError::TransportIdentity { .. }))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = MemoryNetwork::new();
        let result = MeshNode::new(
            MeshConfig::default(),
            Arc::new(network.endpoint("oae-x")),
            Arc::new(MemoryStore::new()),
        )
        .await;
        assert!(matches!(result, Err(MeshError::Config(ConfigError::MissingIdentity))));
    }

    #[tokio::test]
    async fn test_remote_field_error_accepted_once() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a@example.com").await;
        let from = NodeId::new("oae-b");
        let report = ErrorReport {
            field_id: Some("km".into()),
            timestamp: 100,
            ..Default::default()
        };

        assert!(a.apply_remote(&from, Message::ErrorAdded(report.clone())).await);
        assert!(!a.apply_remote(&from, Message::ErrorAdded(report)).await);
        assert_eq!(
            a.snapshot().errors.get("km"),
            Some(&FieldError {
                timestamp: 100,
                ..Default::default()
            })
        );
    }

    #[tokio::test]
    async fn test_self_removal_accepted_exactly_once() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a@example.com").await;
        let from = NodeId::new("oae-b");
        let removal = Message::UserRemoved {
            email: "A@example.com".into(),
        };

        assert!(a.apply_remote(&from, removal.clone()).await);
        assert!(!a.apply_remote(&from, removal).await);
        assert!(a.is_session_invalidated());
    }

    #[tokio::test]
    async fn test_self_removal_event_once() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a@example.com").await;
        let mut events = a.subscribe();
        let from = NodeId::new("oae-b");
        let envelope = Envelope::new(
            &Message::UserRemoved {
                email: "a@example.com".into(),
            },
            &from,
        );

        for _ in 0..3 {
            a.handle(&from, &envelope, envelope.message().unwrap()).await;
        }
        assert_eq!(events.recv().await.unwrap(), MeshEvent::SessionInvalidated);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_typing_without_user_names_known_peer() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a@example.com").await;
        let from = NodeId::new("oae-b");
        a.inner.known.add(KnownPeer::new(from.clone(), "Bia")).await;
        let mut events = a.subscribe();

        let accepted = a
            .apply_remote(
                &from,
                Message::Typing(TypingNotice {
                    is_typing: true,
                    ..Default::default()
                }),
            )
            .await;

        assert!(!accepted);
        match events.recv().await.unwrap() {
            MeshEvent::Typing { from: sender, notice } => {
                assert_eq!(sender, from);
                assert_eq!(notice.user.as_deref(), Some("Bia"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_discovery_adds_unknown_peers() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a@example.com").await;
        let from = NodeId::new("oae-b");
        let mut events = a.subscribe();

        a.apply_remote(
            &from,
            Message::PeerDiscovery {
                peers: vec![a.id().clone(), NodeId::new("oae-c")],
            },
        )
        .await;

        let stats = a.network_stats().await;
        assert_eq!(stats.known_count, 1);
        assert_eq!(stats.known_peers[0].id, NodeId::new("oae-c"));
        assert_eq!(
            events.recv().await.unwrap(),
            MeshEvent::PeersDiscovered {
                peers: vec![NodeId::new("oae-c")]
            }
        );
    }

    #[tokio::test]
    async fn test_publish_work_offline_is_queued() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a@example.com").await;
        let work = a
            .publish_work(WorkRecord {
                code: "OAE-1".into(),
                ..Default::default()
            })
            .await;

        assert_eq!(work.last_modified_by, Some(a.id().clone()));
        assert_eq!(a.network_stats().await.pending_works, 1);
        assert_eq!(a.works().len(), 1);
    }

    #[tokio::test]
    async fn test_discover_from_users_skips_self() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a@example.com").await;
        a.add_user(UserRecord {
            email: "a@example.com".into(),
            ..Default::default()
        })
        .await;
        a.add_user(UserRecord {
            email: "b@example.com".into(),
            name: "Bia".into(),
            ..Default::default()
        })
        .await;

        let added = a.discover_from_users().await;
        assert_eq!(added, vec![derive_node_id("oae", "b@example.com")]);
        assert!(a.discover_from_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_message_fills_defaults() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a@example.com").await;
        let sent = a
            .send_message(ChatMessage {
                text: Some("oi".into()),
                ..Default::default()
            })
            .await;

        assert!(!sent.id.is_empty());
        assert!(sent.timestamp > 0);
        assert_eq!(sent.author.as_deref(), Some("a@example.com"));
        assert_eq!(a.snapshot().mensagens, vec![sent]);
    }

    #[tokio::test]
    async fn test_two_nodes_connect_and_bootstrap() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a@example.com").await;
        let b = node(&network, "b@example.com").await;
        a.send_message(ChatMessage {
            id: "m1".into(),
            timestamp: 1,
            ..Default::default()
        })
        .await;
        a.start();
        b.start();

        assert!(b.connect(a.id()).await.unwrap());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while b.snapshot().mensagens.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(b.snapshot().mensagens[0].id, "m1");
        assert!(a.network_stats().await.known_peers.iter().any(|p| &p.id == b.id()));

        a.shutdown().await;
        b.shutdown().await;
    }
}
