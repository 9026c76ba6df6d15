//! Slot selection policy.
//!
//! Given one capability choice and the current set of schedulable nodes, a
//! [`SlotSelector`] produces a ranked list of candidate slots. The scheduler
//! attempts reservations top-down until one sticks, so the ordering *is* the
//! policy.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};

use crate::capabilities::Capabilities;
use crate::node::{Availability, NodeStatus, SlotId};

/// Produces a ranked list of candidate slots for one capability choice.
pub trait SlotSelector: Send + Sync {
    /// Rank every free, matching slot across the given nodes.
    fn select(&self, capabilities: &Capabilities, nodes: &[NodeStatus]) -> Vec<SlotId>;
}

/// Default policy: spread load, prefer cold nodes, stay deterministic.
///
/// Nodes are ordered by free-slot count (more first), then by the time a
/// session last started anywhere on the node (older first), then by node ID
/// so equal nodes always rank the same way.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSlotSelector;

impl DefaultSlotSelector {
    fn last_session_started(node: &NodeStatus) -> DateTime<Utc> {
        node.slots
            .iter()
            .map(|slot| slot.last_started)
            .max()
            .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
    }
}

impl SlotSelector for DefaultSlotSelector {
    fn select(&self, capabilities: &Capabilities, nodes: &[NodeStatus]) -> Vec<SlotId> {
        let mut candidates: Vec<&NodeStatus> = nodes
            .iter()
            .filter(|node| node.availability == Availability::Up)
            .filter(|node| node.has_capacity_for(capabilities))
            .collect();

        candidates.sort_by_key(|node| {
            let free = node.slots.iter().filter(|slot| slot.is_free()).count();
            (Reverse(free), Self::last_session_started(node), node.node_id)
        });

        candidates
            .into_iter()
            .flat_map(|node| {
                node.slots
                    .iter()
                    .filter(|slot| slot.is_free() && capabilities.matches_stereotype(&slot.stereotype))
                    .map(|slot| slot.id)
            })
            .collect()
    }
}
