//! Session map: the authoritative binding from session ID to node URI.
//!
//! The router consults this mapping for every in-session command; the
//! distributor writes a binding the moment a session is created and the
//! binding disappears when the node reports the session closed. The backing
//! store is replaceable — the core depends only on the [`SessionMap`] trait.

pub mod remote;
pub mod service;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{GridError, Result};
use crate::events::{EventBus, GridEvent};
use crate::session::{Session, SessionId};

/// Authoritative session → node binding.
#[async_trait]
pub trait SessionMap: Send + Sync {
    /// Bind a session. Fails with `SessionExists` if the ID is taken.
    async fn add(&self, session: Session) -> Result<()>;

    /// Look a session up. Fails with `NoSuchSession` on a miss.
    async fn get(&self, id: &SessionId) -> Result<Session>;

    /// URI of the node hosting the session.
    async fn get_uri(&self, id: &SessionId) -> Result<String> {
        Ok(self.get(id).await?.uri)
    }

    /// Remove a binding. Idempotent.
    async fn remove(&self, id: &SessionId) -> Result<()>;

    /// Whether the map can serve lookups.
    async fn is_ready(&self) -> bool;
}

/// In-memory session map.
///
/// Listens for `SessionClosed` events so bindings vanish when a node frees
/// the slot, keeping the map and the grid model in agreement.
pub struct LocalSessionMap {
    sessions: RwLock<HashMap<SessionId, Session>>,
    cancel: CancellationToken,
}

impl LocalSessionMap {
    /// Create a map subscribed to the bus for close events.
    pub fn new(bus: Arc<dyn EventBus>) -> Arc<Self> {
        let map = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        let listener = Arc::clone(&map);
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = listener.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(GridEvent::SessionClosed(id)) => {
                            let _ = listener.remove(&id).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "session map lagged behind the event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        map
    }

    /// Stop the background listener.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Number of live bindings.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether there are no bindings.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionMap for LocalSessionMap {
    async fn add(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(GridError::SessionExists {
                id: session.id.to_string(),
            });
        }
        tracing::debug!(session_id = %session.id, uri = %session.uri, "session bound");
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GridError::NoSuchSession { id: id.to_string() })
    }

    async fn remove(&self, id: &SessionId) -> Result<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }
}
