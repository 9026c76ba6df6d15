//! The grid model: the distributor's materialized view of every node.
//!
//! Pure state, no I/O. The distributor is the single mutator; all calls here
//! happen under its write lock, so the model itself needs no interior
//! locking. Heartbeat recency is tracked with monotonic instants — events
//! arrive in publish order, so a refresh always supersedes the snapshot it
//! replaces.

use std::time::{Duration, Instant};

use crate::error::{GridError, Result};
use crate::node::{Availability, NodeStatus, SlotId};
use crate::session::{NodeId, Session};

/// One known node: its last snapshot plus heartbeat bookkeeping.
struct NodeRecord {
    status: NodeStatus,
    last_heartbeat: Instant,
}

/// Ordered collection of node snapshots with reservation tracking.
#[derive(Default)]
pub struct GridModel {
    nodes: Vec<NodeRecord>,
    reserved: Vec<SlotId>,
}

impl GridModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a node is known.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|record| record.status.node_id == id)
    }

    /// Number of known nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Add a node snapshot. Adding a known node refreshes it instead.
    pub fn add(&mut self, status: NodeStatus) {
        if self.contains(status.node_id) {
            self.refresh(status);
            return;
        }
        self.nodes.push(NodeRecord {
            status,
            last_heartbeat: Instant::now(),
        });
    }

    /// Replace a known node's snapshot with a newer one and touch its
    /// heartbeat. Unknown nodes are ignored — registration is the only way
    /// into the model, so it always stays in step with the handle map.
    pub fn refresh(&mut self, status: NodeStatus) {
        if let Some(record) = self.record_mut(status.node_id) {
            record.status = status;
            record.last_heartbeat = Instant::now();
        }
    }

    /// Record a heartbeat without replacing the snapshot.
    pub fn touch(&mut self, id: NodeId) {
        if let Some(record) = self.record_mut(id) {
            record.last_heartbeat = Instant::now();
        }
    }

    /// Set a node's availability. Returns false for unknown nodes.
    pub fn set_availability(&mut self, id: NodeId, availability: Availability) -> bool {
        match self.record_mut(id) {
            Some(record) => {
                if record.status.availability != availability {
                    tracing::info!(node_id = %id, ?availability, "node availability changed");
                }
                record.status.availability = availability;
                true
            }
            None => false,
        }
    }

    /// Remove a node.
    pub fn remove(&mut self, id: NodeId) {
        self.nodes.retain(|record| record.status.node_id != id);
        self.reserved.retain(|slot| slot.node_id != id);
    }

    /// Mark a slot reserved for an in-flight session attempt.
    ///
    /// Only slots of `UP` nodes can be reserved, which is what keeps any
    /// reservation from succeeding between `drain` and `NodeDrainComplete`.
    pub fn reserve(&mut self, slot_id: SlotId) -> Result<()> {
        let record = self
            .record_mut(slot_id.node_id)
            .ok_or_else(|| GridError::RetrySession {
                message: format!("unable to find node {}; try a different node", slot_id.node_id),
            })?;

        if record.status.availability != Availability::Up {
            return Err(GridError::RetrySession {
                message: format!("node {} is not accepting sessions", slot_id.node_id),
            });
        }

        let slot = record
            .status
            .slots
            .iter()
            .find(|slot| slot.id == slot_id)
            .ok_or_else(|| GridError::RetrySession {
                message: format!("unable to find slot {slot_id}"),
            })?;

        if slot.session.is_some() || self.reserved.contains(&slot_id) {
            return Err(GridError::RetrySession {
                message: format!("slot {slot_id} is already in use"),
            });
        }

        self.reserved.push(slot_id);
        Ok(())
    }

    /// Bind or clear a slot's session, releasing any reservation on it.
    pub fn set_session(&mut self, slot_id: SlotId, session: Option<Session>) {
        self.reserved.retain(|reserved| *reserved != slot_id);
        if let Some(record) = self.record_mut(slot_id.node_id)
            && let Some(slot) = record.status.slots.iter_mut().find(|slot| slot.id == slot_id)
        {
            if let Some(session) = &session {
                slot.last_started = session.started_at;
            }
            slot.session = session;
        }
    }

    /// Clear whichever slot hosts the given session, if any.
    pub fn release_session(&mut self, session_id: &crate::session::SessionId) {
        for record in &mut self.nodes {
            for slot in &mut record.status.slots {
                if slot.session.as_ref().is_some_and(|session| session.id == *session_id) {
                    slot.session = None;
                    return;
                }
            }
        }
    }

    /// Snapshot of every known node.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|record| record.status.clone()).collect()
    }

    /// Nodes that can still be scheduled onto (`availability != DOWN`).
    pub fn available_nodes(&self) -> Vec<NodeStatus> {
        self.nodes
            .iter()
            .filter(|record| record.status.availability != Availability::Down)
            .map(|record| record.status.clone())
            .collect()
    }

    /// Drop nodes silent for longer than `threshold`; returns their IDs.
    pub fn purge_dead_nodes(&mut self, threshold: Duration) -> Vec<NodeId> {
        let dead: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|record| record.last_heartbeat.elapsed() > threshold)
            .map(|record| record.status.node_id)
            .collect();
        for id in &dead {
            tracing::warn!(node_id = %id, "purging node with stale heartbeat");
            self.remove(*id);
        }
        dead
    }
}

impl GridModel {
    fn record_mut(&mut self, id: NodeId) -> Option<&mut NodeRecord> {
        self.nodes.iter_mut().find(|record| record.status.node_id == id)
    }
}
