//! HTTP client for a queue hosted in another process.
//!
//! The distributor uses this to claim (`remove`) and bounce (`retry_add`)
//! requests when the queue runs as its own role.

use async_trait::async_trait;
use serde_json::Value;

use super::SessionQueue;
use crate::capabilities::Capabilities;
use crate::error::{GridError, Result};
use crate::server::{REGISTRATION_SECRET_HEADER, Secret};
use crate::session::{RequestId, SessionRequest};

/// Queue reachable over HTTP.
pub struct RemoteSessionQueue {
    uri: String,
    secret: Secret,
    client: reqwest::Client,
}

impl RemoteSessionQueue {
    /// Build a client for the queue service at `uri`.
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
}

#[async_trait]
impl SessionQueue for RemoteSessionQueue {
    async fn add(&self, request: SessionRequest) -> Result<Value> {
        let url = format!("{}/se/grid/newsessionqueuer/session", self.uri);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if response.status().is_success() {
            return response.json().await.map_err(|e| self.transport(e));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body
            .pointer("/value/message")
            .and_then(Value::as_str)
            .unwrap_or("new session request failed")
            .to_string();
        Err(GridError::SessionNotCreated { message })
    }

    async fn retry_add(&self, request: SessionRequest) -> Result<bool> {
        let url = format!(
            "{}/se/grid/newsessionqueuer/session/retry/{}",
            self.uri, request.request_id
        );
        let response = self
            .authenticated(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if response.status().as_u16() == 401 {
            return Err(GridError::UnauthorizedSecret);
        }
        let response = response.error_for_status().map_err(|e| self.transport(e))?;
        response.json().await.map_err(|e| self.transport(e))
    }

    async fn remove(&self, id: RequestId) -> Result<Option<SessionRequest>> {
        let url = format!("{}/se/grid/newsessionqueuer/session/{}", self.uri, id);
        let response = self
            .authenticated(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        match response.status().as_u16() {
            204 => Ok(None),
            401 => Err(GridError::UnauthorizedSecret),
            _ => {
                let response = response.error_for_status().map_err(|e| self.transport(e))?;
                Ok(Some(response.json().await.map_err(|e| self.transport(e))?))
            }
        }
    }

    async fn clear(&self) -> Result<usize> {
        let url = format!("{}/se/grid/newsessionqueuer/queue", self.uri);
        let response = self
            .authenticated(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if response.status().as_u16() == 401 {
            return Err(GridError::UnauthorizedSecret);
        }
        let response = response.error_for_status().map_err(|e| self.transport(e))?;
        response.json().await.map_err(|e| self.transport(e))
    }

    async fn contents(&self) -> Result<Vec<Capabilities>> {
        let url = format!("{}/se/grid/newsessionqueuer/queue", self.uri);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.transport(e))?;
        response.json().await.map_err(|e| self.transport(e))
    }

    async fn is_ready(&self) -> bool {
        let url = format!("{}/readyz", self.uri);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
