//! Propagation Controller
//!
//! Re-broadcasts accepted remote updates to every peer except the one the
//! update came from. There are no message ids or hop counts: a node only
//! forwards updates that changed its state, and merges are idempotent, so a
//! duplicate arriving through a cycle is absorbed instead of forwarded.

use crate::domain::identity::NodeId;
use crate::replication::connection::ConnectionManager;
use crate::replication::envelope::Envelope;

/// Stamp `envelope` as forwarded on behalf of `from` and send it to all other peers.
///
/// Returns how many peers it reached.
pub async fn propagate(connections: &ConnectionManager, envelope: &Envelope, from: &NodeId) -> usize {
    let forwarded = envelope.propagated(from, connections.local_id());
    let sent = connections.broadcast(&forwarded, Some(from)).await;
    tracing::debug!(kind = %envelope.kind, %from, sent, "propagated");
    sent
}
