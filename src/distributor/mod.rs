//! Distributor: the scheduling core of the grid.
//!
//! Maintains the authoritative view of every node and its slots (the grid
//! model), registers nodes (directly or from bus events), health-checks them
//! periodically, purges the silent ones, and runs the scheduling loop that
//! pairs queued requests with free slots.
//!
//! Concurrency model: one fair read-write lock guards the node-handle map
//! and the grid model together (`tokio::sync::RwLock` queues writers and
//! readers FIFO). The scheduler is a single task that holds the write lock
//! for the duration of a tick, so there is exactly one mutator and readers
//! always observe a consistent snapshot. Health-check I/O runs outside the
//! lock; only the application of its result takes it.

pub mod model;
pub mod remote;
pub mod selector;
pub mod service;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use self::model::GridModel;
use self::selector::{DefaultSlotSelector, SlotSelector};
use crate::error::{GridError, Result};
use crate::events::{EventBus, GridEvent, NewSessionRejected, NewSessionResponse};
use crate::node::remote::RemoteNode;
use crate::node::{Node, NodeStatus};
use crate::queue::SessionQueue;
use crate::server::Secret;
use crate::session::{CreateSessionRequest, NewSessionOutcome, NodeId, RequestId, SessionRequest};
use crate::sessionmap::SessionMap;

/// Scheduler cadence when no event wakes it earlier.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the dead-node purge scan.
const PURGE_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Health-check intervals below this are clamped up.
pub const MIN_HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Distributor status snapshot, served over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorStatus {
    /// Snapshot of every known node.
    pub nodes: Vec<NodeStatus>,
}

/// Everything guarded by the distributor's fair read-write lock.
struct GridState {
    nodes: HashMap<NodeId, Arc<dyn Node>>,
    model: GridModel,
}

/// The local distributor implementation.
pub struct LocalDistributor {
    bus: Arc<dyn EventBus>,
    sessions: Arc<dyn SessionMap>,
    queue: Arc<dyn SessionQueue>,
    secret: Secret,
    healthcheck_interval: Duration,
    purge_timeout: Duration,
    selector: Box<dyn SlotSelector>,
    state: RwLock<GridState>,
    pending: Mutex<VecDeque<RequestId>>,
    health_checks: Mutex<HashMap<NodeId, CancellationToken>>,
    wake: Notify,
    cancel: CancellationToken,
}

impl LocalDistributor {
    /// Create a distributor and start its event, scheduler and purge loops.
    pub fn new(
        bus: Arc<dyn EventBus>,
        sessions: Arc<dyn SessionMap>,
        queue: Arc<dyn SessionQueue>,
        secret: Secret,
        healthcheck_interval: Duration,
        purge_timeout: Duration,
    ) -> Arc<Self> {
        let distributor = Arc::new(Self {
            bus,
            sessions,
            queue,
            secret,
            healthcheck_interval: healthcheck_interval.max(MIN_HEALTHCHECK_INTERVAL),
            purge_timeout,
            selector: Box::new(DefaultSlotSelector),
            state: RwLock::new(GridState {
                nodes: HashMap::new(),
                model: GridModel::new(),
            }),
            pending: Mutex::new(VecDeque::new()),
            health_checks: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        });

        distributor.spawn_event_loop();
        distributor.spawn_scheduler();
        distributor.spawn_purge_loop();
        distributor
    }

    /// Stop all background loops; the current tick is allowed to finish.
    pub fn shutdown(&self) {
        tracing::info!("shutting down distributor");
        self.cancel.cancel();
    }

    /// Ready when the event bus and the session map both are. Probed
    /// concurrently; any failure reads as not-ready.
    pub async fn is_ready(&self) -> bool {
        let (bus_ready, sessions_ready) = tokio::join!(self.bus.is_ready(), self.sessions.is_ready());
        bus_ready && sessions_ready
    }

    /// Register a node handle directly (embedded-node configurations).
    ///
    /// Idempotent: registering a known node only refreshes its heartbeat.
    pub async fn add(self: &Arc<Self>, node: Arc<dyn Node>) -> Result<()> {
        let status = node.status().await?;
        self.add_with_status(node, status).await
    }

    /// Register from an announced status, constructing a remote handle.
    /// Re-announcements from known nodes count as heartbeats.
    pub async fn register(self: &Arc<Self>, status: NodeStatus) -> Result<()> {
        let known = {
            let state = self.state.read().await;
            state.nodes.contains_key(&status.node_id)
        };
        if known {
            let mut state = self.state.write().await;
            state.model.refresh(status);
            return Ok(());
        }

        let node: Arc<dyn Node> = Arc::new(RemoteNode::new(
            status.node_id,
            status.uri.clone(),
            self.secret.clone(),
        ));
        self.add_with_status(node, status).await
    }

    async fn add_with_status(self: &Arc<Self>, node: Arc<dyn Node>, status: NodeStatus) -> Result<()> {
        let id = status.node_id;
        let uri = status.uri.clone();
        {
            let mut state = self.state.write().await;
            if state.nodes.contains_key(&id) {
                state.model.touch(id);
                return Ok(());
            }
            state.nodes.insert(id, Arc::clone(&node));
            state.model.add(status);
        }

        self.install_health_check(node).await;
        self.bus.publish(GridEvent::NodeAdded(id))?;
        tracing::info!(node_id = %id, uri = %uri, "added node");
        Ok(())
    }

    async fn install_health_check(self: &Arc<Self>, node: Arc<dyn Node>) {
        let token = self.cancel.child_token();
        self.health_checks.lock().await.insert(node.id(), token.clone());

        let interval = self.healthcheck_interval;
        let distributor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Probe without the lock; apply the result under it.
                        let result = node.health_check().await;
                        let mut state = distributor.state.write().await;
                        if !state.model.set_availability(node.id(), result.availability) {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Mark a node draining and tell it to finish up. Returns whether the
    /// node reports itself draining.
    pub async fn drain(&self, node_id: NodeId) -> Result<bool> {
        let node = {
            let state = self.state.read().await;
            state.nodes.get(&node_id).cloned()
        };
        let Some(node) = node else {
            tracing::info!(node_id = %node_id, "asked to drain unregistered node");
            return Err(GridError::NoSuchNode {
                id: node_id.to_string(),
            });
        };

        {
            let mut state = self.state.write().await;
            state.model.set_availability(node_id, crate::node::Availability::Draining);
        }
        node.drain().await?;
        Ok(node.is_draining())
    }

    /// Remove a node from the grid entirely.
    pub async fn remove(&self, node_id: NodeId) {
        {
            let mut state = self.state.write().await;
            state.nodes.remove(&node_id);
            state.model.remove(node_id);
        }
        if let Some(token) = self.health_checks.lock().await.remove(&node_id) {
            token.cancel();
        }
        tracing::info!(node_id = %node_id, "removed node");
    }

    /// Status snapshot under the read lock.
    pub async fn status(&self) -> DistributorStatus {
        let state = self.state.read().await;
        DistributorStatus {
            nodes: state.model.snapshot(),
        }
    }

    /// Create a session for a request right now, bypassing the queue.
    ///
    /// Used by the synchronous HTTP endpoint; the scheduling tick goes
    /// through the same matching path.
    pub async fn new_session(&self, request: SessionRequest) -> NewSessionOutcome {
        let mut state = self.state.write().await;
        self.try_create(&mut state, &request).await
    }
}

impl LocalDistributor {
    fn spawn_event_loop(self: &Arc<Self>) {
        let distributor = Arc::clone(self);
        let mut events = distributor.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = distributor.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => distributor.handle_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "distributor lagged behind the event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn handle_event(self: &Arc<Self>, event: GridEvent) {
        match event {
            GridEvent::NodeStatus(status) => {
                if let Err(err) = self.register(status).await {
                    tracing::warn!(error = %err, "failed to register node from status event");
                }
            }
            GridEvent::NodeHeartBeat(status) => {
                let known = {
                    let state = self.state.read().await;
                    state.nodes.contains_key(&status.node_id)
                };
                if known {
                    let mut state = self.state.write().await;
                    state.model.refresh(status);
                } else if let Err(err) = self.register(status).await {
                    tracing::warn!(error = %err, "failed to register node from heartbeat");
                }
            }
            GridEvent::NodeDrainComplete(node_id) => {
                self.remove(node_id).await;
            }
            GridEvent::NewSessionRequest(request_id) => {
                self.pending.lock().await.push_back(request_id);
                self.wake.notify_one();
            }
            GridEvent::SessionClosed(session_id) => {
                let mut state = self.state.write().await;
                state.model.release_session(&session_id);
            }
            _ => {}
        }
    }

    fn spawn_scheduler(self: &Arc<Self>) {
        let distributor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = distributor.cancel.cancelled() => break,
                    _ = distributor.wake.notified() => distributor.tick().await,
                    _ = ticker.tick() => distributor.tick().await,
                }
            }
        });
    }

    fn spawn_purge_loop(self: &Arc<Self>) {
        let distributor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_SCAN_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = distributor.cancel.cancelled() => break,
                    _ = ticker.tick() => distributor.purge_dead_nodes().await,
                }
            }
        });
    }

    /// Drop nodes whose heartbeat is older than the purge threshold.
    pub(crate) async fn purge_dead_nodes(&self) {
        let dead = {
            let mut state = self.state.write().await;
            let dead = state.model.purge_dead_nodes(self.purge_timeout);
            for id in &dead {
                state.nodes.remove(id);
            }
            dead
        };
        for id in dead {
            if let Some(token) = self.health_checks.lock().await.remove(&id) {
                token.cancel();
            }
        }
    }

    /// One scheduling pass. Holds the write lock for the whole tick.
    pub(crate) async fn tick(&self) {
        let mut state = self.state.write().await;

        let request = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return;
            }

            // Leave the request queued until some node can actually host it.
            let has_capacity = state
                .model
                .available_nodes()
                .iter()
                .any(NodeStatus::has_capacity);
            if !has_capacity {
                return;
            }

            let Some(request_id) = pending.pop_front() else {
                return;
            };
            drop(pending);

            match self.queue.remove(request_id).await {
                Ok(Some(request)) => request,
                // Timed out or claimed by another scheduler; nothing to do.
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(request_id = %request_id, error = %err, "failed to claim request from queue");
                    return;
                }
            }
        };

        let request_id = request.request_id;
        match self.try_create(&mut state, &request).await {
            NewSessionOutcome::Created(response) => {
                let _ = self.bus.publish(GridEvent::NewSessionResponse(NewSessionResponse {
                    request_id,
                    session: response.session,
                    encoded: response.encoded,
                }));
            }
            NewSessionOutcome::Retry { message } => {
                let retried = self.queue.retry_add(request).await.unwrap_or(false);
                if !retried {
                    self.reject(request_id, message);
                }
            }
            NewSessionOutcome::Rejected { message } => {
                self.reject(request_id, message);
            }
        }
    }

    fn reject(&self, request_id: RequestId, message: String) {
        tracing::info!(request_id = %request_id, message = %message, "new session request rejected");
        let _ = self.bus.publish(GridEvent::NewSessionRejected(NewSessionRejected {
            request_id,
            message,
        }));
    }

    /// Walk the capability choices and the selector's ranked slots, trying
    /// reservations top-down until a session sticks.
    async fn try_create(&self, state: &mut GridState, request: &SessionRequest) -> NewSessionOutcome {
        for capabilities in &request.capabilities_choices {
            let available = state.model.available_nodes();
            let candidates = self.selector.select(capabilities, &available);

            for slot_id in candidates {
                if state.model.reserve(slot_id).is_err() {
                    continue;
                }
                let Some(node) = state.nodes.get(&slot_id.node_id).cloned() else {
                    state.model.set_session(slot_id, None);
                    continue;
                };

                let create = CreateSessionRequest {
                    dialects: request.dialects.clone(),
                    capabilities: capabilities.clone(),
                    metadata: serde_json::Value::Null,
                };

                match node.new_session(create).await {
                    NewSessionOutcome::Created(response) => {
                        state.model.set_session(slot_id, Some(response.session.clone()));
                        if let Err(err) = self.sessions.add(response.session.clone()).await {
                            // Unroutable session is useless; roll back.
                            state.model.set_session(slot_id, None);
                            let _ = node.stop(&response.session.id).await;
                            return NewSessionOutcome::Rejected {
                                message: format!("unable to bind session in session map: {err}"),
                            };
                        }
                        return NewSessionOutcome::Created(response);
                    }
                    NewSessionOutcome::Retry { message } => {
                        state.model.set_session(slot_id, None);
                        return NewSessionOutcome::Retry { message };
                    }
                    NewSessionOutcome::Rejected { message } => {
                        state.model.set_session(slot_id, None);
                        return NewSessionOutcome::Rejected { message };
                    }
                }
            }
        }

        // Nothing was even reservable. Requests someone could host later are
        // retried; requests no stereotype in the grid can satisfy are dead.
        let snapshot = state.model.snapshot();
        let could_ever_match = request.capabilities_choices.iter().any(|capabilities| {
            snapshot.iter().any(|node| {
                node.slots
                    .iter()
                    .any(|slot| capabilities.matches_stereotype(&slot.stereotype))
            })
        });

        if could_ever_match {
            NewSessionOutcome::Retry {
                message: "all slots matching the requested capabilities are busy".into(),
            }
        } else {
            NewSessionOutcome::Rejected {
                message: "no node in the grid supports the requested capabilities".into(),
            }
        }
    }
}
