//! HTTP handle to a node running in another process.
//!
//! Constructed by the distributor when a node announces itself by event or
//! registers directly. All calls go to the node's service API; transport
//! failures during session creation collapse into the retry path so a
//! network blip never turns into a user-visible rejection.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use super::{Availability, HealthCheckResult, Node, NodeStatus};
use crate::error::{GridError, Result};
use crate::node::factory::{CommandRequest, CommandResponse};
use crate::server::{REGISTRATION_SECRET_HEADER, Secret};
use crate::session::{CreateSessionRequest, NewSessionOutcome, NodeId, SessionId};

/// A node reachable over HTTP.
pub struct RemoteNode {
    id: NodeId,
    uri: String,
    secret: Secret,
    client: reqwest::Client,
    draining: AtomicBool,
}

impl RemoteNode {
    /// Build a handle from a node's announced identity and URI.
    pub fn new(id: NodeId, uri: impl Into<String>, secret: Secret) -> Self {
        Self {
            id,
            uri: uri.into(),
            secret,
            client: reqwest::Client::new(),
            draining: AtomicBool::new(false),
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
}

#[async_trait]
impl Node for RemoteNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn new_session(&self, request: CreateSessionRequest) -> NewSessionOutcome {
        let url = format!("{}/session", self.uri);
        let sent = self.client.post(&url).json(&request).send().await;
        let response = match sent.and_then(reqwest::Response::error_for_status) {
            Ok(response) => response,
            Err(err) => {
                return NewSessionOutcome::Retry {
                    message: format!("node {} unreachable: {err}", self.id),
                };
            }
        };

        match response.json::<NewSessionOutcome>().await {
            Ok(outcome) => outcome,
            Err(err) => NewSessionOutcome::Retry {
                message: format!("undecodable response from node {}: {err}", self.id),
            },
        }
    }

    async fn execute_webdriver_command(
        &self,
        session_id: &SessionId,
        request: CommandRequest,
    ) -> Result<CommandResponse> {
        let method = Method::from_bytes(request.method.as_bytes()).unwrap_or(Method::GET);
        let url = format!("{}/session/{}{}", self.uri, session_id, request.path);

        let mut builder = self.client.request(method, &url);
        if !request.body.is_null() {
            builder = builder.json(&request.body);
        }
        let response = builder.send().await.map_err(|e| self.transport(e))?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(CommandResponse { status, body })
    }

    async fn stop(&self, session_id: &SessionId) -> Result<()> {
        let url = format!("{}/session/{}", self.uri, session_id);
        self.client
            .delete(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.transport(e))?;
        Ok(())
    }

    async fn status(&self) -> Result<NodeStatus> {
        let url = format!("{}/status", self.uri);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.transport(e))?;
        let status: NodeStatus = response
            .json()
            .await
            .map_err(|e| self.transport(e))?;
        Ok(status)
    }

    async fn health_check(&self) -> HealthCheckResult {
        let url = format!("{}/healthz", self.uri);
        let probed = async {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)?;
            response.json::<HealthCheckResult>().await
        }
        .await;

        match probed {
            Ok(result) => {
                if result.availability == Availability::Draining {
                    self.draining.store(true, Ordering::SeqCst);
                }
                result
            }
            Err(err) => HealthCheckResult {
                availability: Availability::Down,
                message: format!("unable to run healthcheck against {}: {err}", self.uri),
            },
        }
    }

    async fn drain(&self) -> Result<()> {
        let url = format!("{}/se/grid/node/drain", self.uri);
        self.authenticated(self.client.post(&url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.transport(e))?;
        self.draining.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}
