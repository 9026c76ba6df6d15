//! Node: a bounded pool of browser slots.
//!
//! A node owns a fixed set of slots, each advertising a *stereotype* (the
//! capability template it can satisfy) and hosting at most one session. The
//! distributor talks to nodes through the [`Node`] trait, either in-process
//! ([`LocalNode`]) or over HTTP ([`remote::RemoteNode`]).
//!
//! Slot-set operations are serialized per node; individual sessions are
//! independent. A slot moves free → reserved → busy: reservation happens
//! under the slot lock, the factory call runs outside it so one slow driver
//! launch does not freeze status reads and heartbeats.

pub mod factory;
pub mod remote;
pub mod service;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use self::factory::{
    ActiveSession, CommandRequest, CommandResponse, DriverDescriptor, FactoryRegistry, SessionFactory,
};
use crate::capabilities::Capabilities;
use crate::error::{GridError, Result};
use crate::events::{EventBus, GridEvent};
use crate::session::{
    CreateSessionRequest, CreateSessionResponse, Dialect, NewSessionOutcome, NodeId, Session, SessionId,
};

/// How often the idle-session sweeper runs.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Whether a node can take work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Availability {
    /// Healthy and accepting sessions.
    Up,
    /// Finishing existing sessions, refusing new ones.
    Draining,
    /// Unreachable or unhealthy.
    Down,
}

/// Host platform details reported in status snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    /// CPU architecture.
    pub arch: String,
    /// Operating system name.
    pub name: String,
    /// Release family where known.
    pub version: String,
}

impl OsInfo {
    /// Describe the host this process runs on.
    pub fn current() -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            name: std::env::consts::OS.to_string(),
            version: std::env::consts::FAMILY.to_string(),
        }
    }
}

/// Stable identifier of one slot: owning node plus slot-local index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    /// The node owning the slot.
    pub node_id: NodeId,
    /// Slot-local index, stable for the slot's lifetime.
    pub index: u32,
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node_id, self.index)
    }
}

/// Snapshot of one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    /// Slot identifier.
    pub id: SlotId,
    /// Capability template the slot advertises.
    pub stereotype: Capabilities,
    /// When a session last started on this slot.
    pub last_started: DateTime<Utc>,
    /// The session currently occupying the slot, if any.
    pub session: Option<Session>,
}

impl Slot {
    /// Whether the slot can accept a session.
    pub fn is_free(&self) -> bool {
        self.session.is_none()
    }
}

/// Full status snapshot of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node identifier.
    pub node_id: NodeId,
    /// Base URI the node serves its API on.
    pub uri: String,
    /// Current availability.
    pub availability: Availability,
    /// Upper bound on concurrent sessions across all slots.
    pub max_sessions: usize,
    /// All slots, free and busy.
    pub slots: Vec<Slot>,
    /// Software version of the node.
    pub version: String,
    /// Host platform details.
    pub os_info: OsInfo,
}

impl NodeStatus {
    /// Whether at least one slot is free.
    pub fn has_capacity(&self) -> bool {
        self.slots.iter().any(Slot::is_free)
    }

    /// Whether a free slot could satisfy the given capabilities.
    pub fn has_capacity_for(&self, capabilities: &Capabilities) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.is_free() && capabilities.matches_stereotype(&slot.stereotype))
    }

    /// Number of slots currently hosting a session.
    pub fn active_sessions(&self) -> usize {
        self.slots.iter().filter(|slot| slot.session.is_some()).count()
    }
}

/// Result of a node self-probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Availability the probe concluded.
    pub availability: Availability,
    /// Human-readable explanation.
    pub message: String,
}

/// Handle to a node, local or remote.
#[async_trait]
pub trait Node: Send + Sync {
    /// The node's identifier.
    fn id(&self) -> NodeId;

    /// Base URI of the node's API.
    fn uri(&self) -> &str;

    /// Atomically select a free matching slot and start a session on it.
    async fn new_session(&self, request: CreateSessionRequest) -> NewSessionOutcome;

    /// Forward an in-session WebDriver command.
    async fn execute_webdriver_command(
        &self,
        session_id: &SessionId,
        request: CommandRequest,
    ) -> Result<CommandResponse>;

    /// Stop a session and free its slot.
    async fn stop(&self, session_id: &SessionId) -> Result<()>;

    /// Current status snapshot.
    async fn status(&self) -> Result<NodeStatus>;

    /// Self-probe. Never fails; failures surface as `Down`.
    async fn health_check(&self) -> HealthCheckResult;

    /// Refuse new sessions and finish the existing ones.
    async fn drain(&self) -> Result<()>;

    /// Whether the node is draining.
    fn is_draining(&self) -> bool;
}

/// One slot plus its runtime state.
struct SlotState {
    index: u32,
    stereotype: Capabilities,
    factory: Arc<dyn SessionFactory>,
    last_started: DateTime<Utc>,
    last_used: DateTime<Utc>,
    reserved: bool,
    session: Option<RunningSession>,
}

struct RunningSession {
    record: Session,
    handler: Arc<dyn ActiveSession>,
}

impl SlotState {
    fn is_free(&self) -> bool {
        !self.reserved && self.session.is_none()
    }

    fn snapshot(&self, node_id: NodeId) -> Slot {
        Slot {
            id: SlotId {
                node_id,
                index: self.index,
            },
            stereotype: self.stereotype.clone(),
            last_started: self.last_started,
            session: self.session.as_ref().map(|running| running.record.clone()),
        }
    }
}

/// Builder for [`LocalNode`].
pub struct LocalNodeBuilder {
    uri: String,
    bus: Arc<dyn EventBus>,
    max_sessions: Option<usize>,
    heartbeat_period: Duration,
    session_timeout: Duration,
    drivers: Vec<(Capabilities, Arc<dyn SessionFactory>, usize)>,
}

impl LocalNodeBuilder {
    /// Start building a node serving at `uri`.
    pub fn new(uri: impl Into<String>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            uri: uri.into(),
            bus,
            max_sessions: None,
            heartbeat_period: Duration::from_secs(60),
            session_timeout: Duration::from_secs(300),
            drivers: Vec::new(),
        }
    }

    /// Cap concurrent sessions across all slots (default: slot count).
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// How often the node publishes a heartbeat (default: 60 s).
    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// How long a session may sit idle before being stopped (default: 300 s).
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Add `slot_count` slots advertising `stereotype`, backed by `factory`.
    pub fn add_driver(
        mut self,
        stereotype: Capabilities,
        factory: Arc<dyn SessionFactory>,
        slot_count: usize,
    ) -> Self {
        self.drivers.push((stereotype, factory, slot_count));
        self
    }

    /// Add slots for configuration-supplied descriptors, resolving factories
    /// through the registry.
    pub fn add_descriptors(
        mut self,
        registry: &FactoryRegistry,
        descriptors: &[DriverDescriptor],
    ) -> Result<Self> {
        for descriptor in descriptors {
            let factory = registry.create(descriptor)?;
            self = self.add_driver(descriptor.stereotype.clone(), factory, descriptor.max_sessions);
        }
        Ok(self)
    }

    /// Build the node and start its background loops.
    pub fn build(self) -> Arc<LocalNode> {
        let mut slots = Vec::new();
        let epoch = Utc::now();
        for (stereotype, factory, slot_count) in self.drivers {
            for _ in 0..slot_count {
                slots.push(SlotState {
                    index: slots.len() as u32,
                    stereotype: stereotype.clone(),
                    factory: factory.clone(),
                    last_started: epoch,
                    last_used: epoch,
                    reserved: false,
                    session: None,
                });
            }
        }

        let max_sessions = self.max_sessions.unwrap_or(slots.len()).max(1);
        let node = Arc::new(LocalNode {
            id: NodeId::new(),
            uri: self.uri,
            bus: self.bus,
            max_sessions,
            session_timeout: self.session_timeout,
            draining: AtomicBool::new(false),
            slots: Mutex::new(slots),
            cancel: CancellationToken::new(),
        });

        node.spawn_heartbeat(self.heartbeat_period);
        node.spawn_session_sweeper();

        tracing::info!(node_id = %node.id, uri = %node.uri, max_sessions, "local node started");
        node
    }
}

/// In-process node implementation.
pub struct LocalNode {
    id: NodeId,
    uri: String,
    bus: Arc<dyn EventBus>,
    max_sessions: usize,
    session_timeout: Duration,
    draining: AtomicBool,
    slots: Mutex<Vec<SlotState>>,
    cancel: CancellationToken,
}

impl LocalNode {
    /// Start building a node.
    pub fn builder(uri: impl Into<String>, bus: Arc<dyn EventBus>) -> LocalNodeBuilder {
        LocalNodeBuilder::new(uri, bus)
    }

    /// Stop background loops. Running sessions are left to their factories.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_heartbeat(self: &Arc<Self>, period: Duration) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = node.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Ok(status) = node.status().await {
                            let _ = node.bus.publish(GridEvent::NodeHeartBeat(status));
                        }
                    }
                }
            }
        });
    }

    fn spawn_session_sweeper(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = node.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = node.expire_idle_sessions().await;
                        for id in expired {
                            tracing::warn!(node_id = %node.id, session_id = %id, "stopped idle session");
                        }
                    }
                }
            }
        });
    }

    /// Stop sessions idle past the session timeout; returns their IDs.
    pub(crate) async fn expire_idle_sessions(&self) -> Vec<SessionId> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.session_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let mut expired = Vec::new();
        {
            let slots = self.slots.lock().await;
            for slot in slots.iter() {
                if let Some(running) = &slot.session
                    && slot.last_used < cutoff
                {
                    expired.push(running.record.id.clone());
                }
            }
        }
        for id in &expired {
            let _ = self.stop(id).await;
        }
        expired
    }

    async fn finish_drain_if_idle(&self) {
        if !self.is_draining() {
            return;
        }
        let active = {
            let slots = self.slots.lock().await;
            slots.iter().filter(|slot| slot.session.is_some()).count()
        };
        if active == 0 {
            tracing::info!(node_id = %self.id, "drain complete");
            let _ = self.bus.publish(GridEvent::NodeDrainComplete(self.id));
        }
    }

    /// Encode the created-session response in the client's dialect.
    fn encode_created(dialects: &[Dialect], session: &Session) -> Value {
        match dialects.first().copied().unwrap_or(Dialect::W3c) {
            Dialect::W3c => json!({
                "value": {
                    "sessionId": session.id,
                    "capabilities": session.capabilities,
                }
            }),
            Dialect::Oss => json!({
                "status": 0,
                "sessionId": session.id,
                "value": session.capabilities,
            }),
        }
    }
}

#[async_trait]
impl Node for LocalNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn new_session(&self, request: CreateSessionRequest) -> NewSessionOutcome {
        if self.is_draining() {
            return NewSessionOutcome::Rejected {
                message: "node is draining; no new sessions accepted".into(),
            };
        }

        // Reserve under the slot lock, launch outside it.
        let (slot_index, stereotype, factory) = {
            let mut slots = self.slots.lock().await;

            let in_use = slots.iter().filter(|slot| !slot.is_free()).count();
            if in_use >= self.max_sessions {
                return NewSessionOutcome::Retry {
                    message: format!("node at max session count ({})", self.max_sessions),
                };
            }

            let chosen = slots
                .iter()
                .position(|slot| slot.is_free() && request.capabilities.matches_stereotype(&slot.stereotype));
            match chosen {
                Some(index) => {
                    let slot = &mut slots[index];
                    slot.reserved = true;
                    (slot.index, slot.stereotype.clone(), slot.factory.clone())
                }
                None => {
                    let compatible_exists = slots
                        .iter()
                        .any(|slot| request.capabilities.matches_stereotype(&slot.stereotype));
                    return if compatible_exists {
                        NewSessionOutcome::Retry {
                            message: "all compatible slots are busy".into(),
                        }
                    } else {
                        NewSessionOutcome::Rejected {
                            message: format!("no slot stereotype matches {}", request.capabilities),
                        }
                    };
                }
            }
        };

        let created = factory.create(&stereotype, &request).await;

        let mut slots = self.slots.lock().await;
        let slot = &mut slots[slot_index as usize];
        slot.reserved = false;

        match created {
            Ok(handler) => {
                let now = Utc::now();
                let record = Session {
                    id: handler.id(),
                    uri: self.uri.clone(),
                    stereotype,
                    capabilities: handler.capabilities(),
                    started_at: now,
                };
                slot.last_started = now;
                slot.last_used = now;
                slot.session = Some(RunningSession {
                    record: record.clone(),
                    handler,
                });
                tracing::info!(node_id = %self.id, session_id = %record.id, "session started");
                let encoded = Self::encode_created(&request.dialects, &record);
                NewSessionOutcome::Created(CreateSessionResponse {
                    session: record,
                    encoded,
                })
            }
            Err(failure) if failure.retryable => NewSessionOutcome::Retry {
                message: failure.message,
            },
            Err(failure) => NewSessionOutcome::Rejected {
                message: failure.message,
            },
        }
    }

    async fn execute_webdriver_command(
        &self,
        session_id: &SessionId,
        request: CommandRequest,
    ) -> Result<CommandResponse> {
        let handler = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .iter_mut()
                .find(|slot| {
                    slot.session
                        .as_ref()
                        .is_some_and(|running| running.record.id == *session_id)
                })
                .ok_or_else(|| GridError::NoSuchSession {
                    id: session_id.to_string(),
                })?;
            slot.last_used = Utc::now();
            slot.session.as_ref().map(|running| running.handler.clone())
        };

        match handler {
            Some(handler) => handler.execute(request).await,
            None => Err(GridError::NoSuchSession {
                id: session_id.to_string(),
            }),
        }
    }

    async fn stop(&self, session_id: &SessionId) -> Result<()> {
        let running = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .iter_mut()
                .find(|slot| {
                    slot.session
                        .as_ref()
                        .is_some_and(|running| running.record.id == *session_id)
                })
                .ok_or_else(|| GridError::NoSuchSession {
                    id: session_id.to_string(),
                })?;
            slot.session.take()
        };

        if let Some(running) = running {
            running.handler.stop().await;
            tracing::info!(node_id = %self.id, session_id = %session_id, "session stopped");
            let _ = self.bus.publish(GridEvent::SessionClosed(session_id.clone()));
        }

        self.finish_drain_if_idle().await;
        Ok(())
    }

    async fn status(&self) -> Result<NodeStatus> {
        let availability = if self.is_draining() {
            Availability::Draining
        } else {
            Availability::Up
        };
        let slots = self.slots.lock().await;
        Ok(NodeStatus {
            node_id: self.id,
            uri: self.uri.clone(),
            availability,
            max_sessions: self.max_sessions,
            slots: slots.iter().map(|slot| slot.snapshot(self.id)).collect(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os_info: OsInfo::current(),
        })
    }

    async fn health_check(&self) -> HealthCheckResult {
        if self.is_draining() {
            HealthCheckResult {
                availability: Availability::Draining,
                message: "draining".into(),
            }
        } else {
            HealthCheckResult {
                availability: Availability::Up,
                message: "ok".into(),
            }
        }
    }

    async fn drain(&self) -> Result<()> {
        self.draining.store(true, Ordering::SeqCst);
        tracing::info!(node_id = %self.id, "node draining");
        self.finish_drain_if_idle().await;
        Ok(())
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}
