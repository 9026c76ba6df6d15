//! HTTP client for a distributor in another process, plus the registration
//! loop an out-of-process node runs against it.
//!
//! A node without a shared event bus announces itself by POSTing its status
//! to the distributor every registration cycle until it shows up in the
//! distributor's status, then keeps re-announcing at the heartbeat period —
//! re-registration is idempotent and doubles as the heartbeat.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::DistributorStatus;
use crate::error::{GridError, Result};
use crate::node::{Node, NodeStatus};
use crate::server::{REGISTRATION_SECRET_HEADER, Secret};
use crate::session::{NewSessionOutcome, NodeId, SessionRequest};

/// Distributor reachable over HTTP.
pub struct RemoteDistributor {
    uri: String,
    secret: Secret,
    client: reqwest::Client,
}

impl RemoteDistributor {
    /// Build a client for the distributor service at `uri`.
    pub fn new(uri: impl Into<String>, secret: Secret) -> Self {
        Self {
            uri: uri.into(),
            secret,
            client: reqwest::Client::new(),
        }
    }

    fn authenticated(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.secret.is_empty() {
            builder
        } else {
            builder.header(REGISTRATION_SECRET_HEADER, self.secret.value())
        }
    }

    fn transport(&self, source: reqwest::Error) -> GridError {
        GridError::Transport {
            uri: self.uri.clone(),
            source,
        }
    }

    /// Announce a node's status. Idempotent.
    pub async fn register(&self, status: &NodeStatus) -> Result<()> {
        let url = format!("{}/se/grid/distributor/node", self.uri);
        let response = self
            .authenticated(self.client.post(&url))
            .json(status)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if response.status().as_u16() == 401 {
            return Err(GridError::UnauthorizedSecret);
        }
        response.error_for_status().map_err(|e| self.transport(e))?;
        Ok(())
    }

    /// Ask the distributor to create a session synchronously.
    pub async fn new_session(&self, request: &SessionRequest) -> Result<NewSessionOutcome> {
        let url = format!("{}/se/grid/distributor/session", self.uri);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.transport(e))?;
        response.json().await.map_err(|e| self.transport(e))
    }

    /// Ask the distributor to drain a node.
    pub async fn drain_node(&self, node_id: NodeId) -> Result<bool> {
        let url = format!("{}/se/grid/distributor/node/{}/drain", self.uri, node_id);
        let response = self
            .authenticated(self.client.post(&url))
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if response.status().as_u16() == 401 {
            return Err(GridError::UnauthorizedSecret);
        }
        let response = response.error_for_status().map_err(|e| self.transport(e))?;
        response.json().await.map_err(|e| self.transport(e))
    }

    /// Fetch the distributor's status snapshot.
    pub async fn status(&self) -> Result<DistributorStatus> {
        let url = format!("{}/se/grid/distributor/status", self.uri);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.transport(e))?;
        response.json().await.map_err(|e| self.transport(e))
    }

    /// Whether the distributor answers its readiness probe.
    pub async fn is_ready(&self) -> bool {
        let url = format!("{}/readyz", self.uri);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Keep a node registered with a remote distributor.
///
/// Announces every `register_cycle` until the node appears in the
/// distributor's status; gives up after `register_period`. Once registered,
/// keeps announcing at `heartbeat_period` so the distributor's purge scan
/// never reaps a healthy node.
pub async fn run_registration_loop(
    distributor: Arc<RemoteDistributor>,
    node: Arc<dyn Node>,
    register_cycle: Duration,
    register_period: Duration,
    heartbeat_period: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let started = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if started.elapsed() > register_period {
            return Err(GridError::InvalidConfig {
                key: "node.register-period".into(),
                reason: format!(
                    "node failed to register with the distributor within {register_period:?}"
                ),
            });
        }

        let status = node.status().await?;
        let node_id = status.node_id;
        if let Err(err) = distributor.register(&status).await {
            tracing::warn!(error = %err, "node registration attempt failed");
        } else if let Ok(status) = distributor.status().await
            && status.nodes.iter().any(|n| n.node_id == node_id)
        {
            tracing::info!(node_id = %node_id, "node registered with distributor");
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(register_cycle) => {}
        }
    }

    // Registered; re-announce at the heartbeat period.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(heartbeat_period) => {
                match node.status().await {
                    Ok(status) => {
                        if let Err(err) = distributor.register(&status).await {
                            tracing::warn!(error = %err, "node heartbeat to distributor failed");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "unable to read node status for heartbeat"),
                }
            }
        }
    }
}
