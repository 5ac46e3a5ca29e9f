//! Message Router
//!
//! Decodes inbound frames and hands typed messages to a handler.
//! Unknown types and malformed payloads are logged and dropped; neither
//! ever tears down the connection.

use crate::domain::identity::NodeId;
use crate::replication::connection::ConnectionManager;
use crate::replication::envelope::{self, Envelope, Message};
use async_trait::async_trait;

/// Receives every successfully decoded, known message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, from: &NodeId, envelope: &Envelope, message: Message);
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handled(String),
    Unknown(String),
    Malformed,
}

/// Decode `frame` from `from` and dispatch it.
///
/// The peer's `last_sync_at` is refreshed whatever the outcome.
pub async fn dispatch(
    connections: &ConnectionManager,
    handler: &dyn MessageHandler,
    from: &NodeId,
    frame: &[u8],
) -> Dispatch {
    let outcome = route(handler, from, frame).await;
    connections.touch(from);
    outcome
}

async fn route(handler: &dyn MessageHandler, from: &NodeId, frame: &[u8]) -> Dispatch {
    let envelope = match envelope::decode(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(%from, error = %e, "dropping malformed frame");
            return Dispatch::Malformed;
        }
    };

    let message = match envelope.message() {
        Ok(Message::Unknown(kind)) => {
            tracing::warn!(%from, %kind, "ignoring unknown message type");
            return Dispatch::Unknown(kind);
        }
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(%from, kind = %envelope.kind, error = %e, "dropping invalid payload");
            return Dispatch::Malformed;
        }
    };

    tracing::debug!(%from, kind = %envelope.kind, "dispatching");
    let kind = envelope.kind.clone();
    handler.handle(from, &envelope, message).await;
    Dispatch::Handled(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryNetwork;
    use crate::replication::events::EventBus;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(NodeId, String)>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, from: &NodeId, _envelope: &Envelope, message: Message) {
            self.seen.lock().push((from.clone(), message.kind().to_string()));
        }
    }

    async fn connected() -> (ConnectionManager, NodeId) {
        let network = MemoryNetwork::new();
        let manager = ConnectionManager::new(
            Arc::new(network.endpoint("oae-a")),
            Duration::from_millis(100),
            EventBus::new(8),
        );
        let peer = NodeId::new("oae-b");
        let _b = network.endpoint("oae-b");
        manager.connect(&peer).await.unwrap();
        (manager, peer)
    }

    #[tokio::test]
    async fn test_known_message_is_handled() {
        let (manager, peer) = connected().await;
        let recorder = Recorder::default();
        let frame = envelope::encode(&Envelope::new(&Message::SyncRequest, &peer)).unwrap();

        let outcome = dispatch(&manager, &recorder, &peer, &frame).await;
        assert_eq!(outcome, Dispatch::Handled("sync_request".into()));
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_unknown_type_is_logged_and_dropped() {
        let (manager, peer) = connected().await;
        let recorder = Recorder::default();

        let outcome = dispatch(
            &manager,
            &recorder,
            &peer,
            br#"{"type":"work_share_link","payload":{}}"#,
        )
        .await;
        assert_eq!(outcome, Dispatch::Unknown("work_share_link".into()));
        assert!(recorder.seen.lock().is_empty());
        assert!(logs_contain("ignoring unknown message type"));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (manager, peer) = connected().await;
        let recorder = Recorder::default();

        assert_eq!(dispatch(&manager, &recorder, &peer, b"{oops").await, Dispatch::Malformed);
        assert_eq!(
            dispatch(
                &manager,
                &recorder,
                &peer,
                br#"{"type":"user_added","payload":{"user":42}}"#
            )
            .await,
            Dispatch::Malformed
        );
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_last_sync_updated_regardless_of_outcome() {
        let (manager, peer) = connected().await;
        let recorder = Recorder::default();
        assert!(manager.snapshot()[0].last_sync_at.is_none());

        dispatch(&manager, &recorder, &peer, b"garbage").await;
        assert!(manager.snapshot()[0].last_sync_at.is_some());
    }
}
