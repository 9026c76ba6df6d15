//! HTTP client for a session map hosted in another process.

use async_trait::async_trait;

use super::SessionMap;
use crate::error::{GridError, Result};
use crate::server::{REGISTRATION_SECRET_HEADER, Secret};
use crate::session::{Session, SessionId};

/// Session map reachable over HTTP.
pub struct RemoteSessionMap {
    uri: String,
    secret: Secret,
    client: reqwest::Client,
}

impl RemoteSessionMap {
    /// Build a client for the map service at `uri`.
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
impl SessionMap for RemoteSessionMap {
    async fn add(&self, session: Session) -> Result<()> {
        let url = format!("{}/se/grid/sessions", self.uri);
        let response = self
            .authenticated(self.client.post(&url))
            .json(&session)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        match response.status().as_u16() {
            201 => Ok(()),
            401 => Err(GridError::UnauthorizedSecret),
            _ => Err(GridError::SessionExists {
                id: session.id.to_string(),
            }),
        }
    }

    async fn get(&self, id: &SessionId) -> Result<Session> {
        let url = format!("{}/se/grid/sessions/{}", self.uri, id);
        let response = self.client.get(&url).send().await.map_err(|e| self.transport(e))?;

        if response.status().as_u16() == 404 {
            return Err(GridError::NoSuchSession { id: id.to_string() });
        }
        let response = response.error_for_status().map_err(|e| self.transport(e))?;
        response.json().await.map_err(|e| self.transport(e))
    }

    async fn remove(&self, id: &SessionId) -> Result<()> {
        let url = format!("{}/se/grid/sessions/{}", self.uri, id);
        let response = self
            .authenticated(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        match response.status().as_u16() {
            401 => Err(GridError::UnauthorizedSecret),
            _ => Ok(()),
        }
    }

    async fn is_ready(&self) -> bool {
        let url = format!("{}/readyz", self.uri);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
