//! Process-wide publish/subscribe channel for grid lifecycle events.
//!
//! Every role observes the same typed [`GridEvent`] stream. Publishing never
//! blocks beyond the bounded channel buffer, and delivery is at-most-once per
//! subscriber in publish order. Slow subscribers may observe loss (the
//! broadcast channel reports a lag instead of back-pressuring publishers);
//! components tolerate this by also accepting direct registration over HTTP
//! and by re-deriving state from periodic heartbeats.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::node::NodeStatus;
use crate::session::{NodeId, RequestId, Session, SessionId};

/// Default buffer size for the local event channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Terminal success event payload: the response the queue hands back to the
/// blocked client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionResponse {
    /// The request this responds to.
    pub request_id: RequestId,
    /// The created session.
    pub session: Session,
    /// Dialect-encoded response body.
    pub encoded: Value,
}

/// Terminal failure event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionRejected {
    /// The request this rejects.
    pub request_id: RequestId,
    /// User-visible failure message.
    pub message: String,
}

/// Lifecycle events flowing between grid components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GridEvent {
    /// A node published its full status snapshot.
    NodeStatus(NodeStatus),
    /// A node heartbeat, carrying the current status snapshot.
    NodeHeartBeat(NodeStatus),
    /// The distributor accepted a node into the grid.
    NodeAdded(NodeId),
    /// A draining node finished its last session.
    NodeDrainComplete(NodeId),
    /// A request entered the new-session queue.
    NewSessionRequest(RequestId),
    /// A queued request was matched and a session created.
    NewSessionResponse(NewSessionResponse),
    /// A queued request terminally failed.
    NewSessionRejected(NewSessionRejected),
    /// A session ended and its slot was freed.
    SessionClosed(SessionId),
}

/// Publish/subscribe channel for [`GridEvent`]s.
///
/// The local implementation is an in-process broadcast channel; a clustered
/// deployment can bridge an external bus into the same subscriber surface.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to all current subscribers. Never blocks.
    fn publish(&self, event: GridEvent) -> Result<()>;

    /// Install a new subscription starting at the current stream position.
    fn subscribe(&self) -> broadcast::Receiver<GridEvent>;

    /// Whether the bus is able to deliver events.
    async fn is_ready(&self) -> bool;
}

/// In-process event bus backed by a bounded broadcast channel.
pub struct LocalEventBus {
    tx: broadcast::Sender<GridEvent>,
}

impl LocalEventBus {
    /// Create a bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    fn publish(&self, event: GridEvent) -> Result<()> {
        // A send error only means there are no subscribers right now, which
        // is indistinguishable from lossy delivery as far as the contract is
        // concerned.
        if self.tx.send(event).is_err() {
            tracing::trace!("event published with no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.tx.subscribe()
    }

    async fn is_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = LocalEventBus::new();
        let mut rx = bus.subscribe();

        let first = RequestId::new();
        let second = RequestId::new();
        bus.publish(GridEvent::NewSessionRequest(first)).unwrap();
        bus.publish(GridEvent::NewSessionRequest(second)).unwrap();

        match rx.recv().await.unwrap() {
            GridEvent::NewSessionRequest(id) => assert_eq!(id, first),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            GridEvent::NewSessionRequest(id) => assert_eq!(id, second),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = LocalEventBus::new();
        assert!(bus.publish(GridEvent::NodeAdded(NodeId::new())).is_ok());
    }

    #[tokio::test]
    async fn local_bus_is_always_ready() {
        let bus = LocalEventBus::new();
        assert!(bus.is_ready().await);
    }
}
