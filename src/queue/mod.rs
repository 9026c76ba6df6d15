//! New-session request queue.
//!
//! Strict FIFO with one exception: [`SessionQueue::retry_add`] reinserts a
//! bounced request at the *head* so a transient slot shortage does not send
//! it to the back of the line. `add` blocks the caller until the request is
//! matched or its deadline passes; completion arrives over the event bus, so
//! the queue never holds a reference to any distributor.
//!
//! Two durations govern a request's life: the *request timeout* caps its
//! total age in the queue, and the *retry interval* is the cadence of the
//! expiry sweep.

pub mod remote;
pub mod service;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::capabilities::Capabilities;
use crate::error::{GridError, Result};
use crate::events::{EventBus, GridEvent, NewSessionRejected, NewSessionResponse};
use crate::session::{RequestId, SessionRequest};

/// FIFO of pending session requests with retry-to-head and bounded wait.
#[async_trait]
pub trait SessionQueue: Send + Sync {
    /// Enqueue and block until the request is matched or times out.
    ///
    /// On success the dialect-encoded new-session response is returned for
    /// relaying to the client untouched.
    async fn add(&self, request: SessionRequest) -> Result<Value>;

    /// Reinsert a bounced request at the head. Returns `false` when the
    /// request's deadline has already elapsed.
    async fn retry_add(&self, request: SessionRequest) -> Result<bool>;

    /// Dequeue a specific request, if it is still queued.
    async fn remove(&self, id: RequestId) -> Result<Option<SessionRequest>>;

    /// Drop everything, returning how many requests were dropped.
    async fn clear(&self) -> Result<usize>;

    /// First capability choice of every queued request, for the UI.
    async fn contents(&self) -> Result<Vec<Capabilities>>;

    /// Whether the queue can accept requests.
    async fn is_ready(&self) -> bool;
}

/// In-process queue implementation.
pub struct LocalSessionQueue {
    bus: Arc<dyn EventBus>,
    request_timeout: Duration,
    queue: Mutex<VecDeque<SessionRequest>>,
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<Result<NewSessionResponse>>>>,
    cancel: CancellationToken,
}

impl LocalSessionQueue {
    /// Create a queue and start its completion listener and expiry sweeper.
    pub fn new(bus: Arc<dyn EventBus>, request_timeout: Duration, retry_interval: Duration) -> Arc<Self> {
        let queue = Arc::new(Self {
            bus,
            request_timeout,
            queue: Mutex::new(VecDeque::new()),
            waiters: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        queue.spawn_completion_listener();
        queue.spawn_expiry_sweeper(retry_interval);
        queue
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Number of queued requests.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Whether the queue holds no requests.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    fn spawn_completion_listener(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        let mut events = queue.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = queue.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(GridEvent::NewSessionResponse(response)) => {
                            queue.complete(response.request_id, Ok(response)).await;
                        }
                        Ok(GridEvent::NewSessionRejected(rejection)) => {
                            queue
                                .complete(
                                    rejection.request_id,
                                    Err(GridError::SessionNotCreated {
                                        message: rejection.message,
                                    }),
                                )
                                .await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "queue lagged behind the event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_expiry_sweeper(self: &Arc<Self>, interval: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = queue.cancel.cancelled() => break,
                    _ = ticker.tick() => queue.expire_overdue().await,
                }
            }
        });
    }

    /// Resolve a blocked `add` call. Each request resolves at most once.
    async fn complete(&self, id: RequestId, result: Result<NewSessionResponse>) {
        if let Some(waiter) = self.waiters.lock().await.remove(&id) {
            let _ = waiter.send(result);
        }
    }

    /// Remove requests past their deadline and reject them.
    async fn expire_overdue(&self) {
        let expired: Vec<SessionRequest> = {
            let mut queue = self.queue.lock().await;
            let mut keep = VecDeque::with_capacity(queue.len());
            let mut overdue = Vec::new();
            for request in queue.drain(..) {
                if self.is_expired(&request) {
                    overdue.push(request);
                } else {
                    keep.push_back(request);
                }
            }
            *queue = keep;
            overdue
        };

        for request in expired {
            tracing::info!(request_id = %request.request_id, "request timed out in queue");
            let _ = self.bus.publish(GridEvent::NewSessionRejected(NewSessionRejected {
                request_id: request.request_id,
                message: format!(
                    "new session request timed out after {:?} in queue",
                    self.request_timeout
                ),
            }));
        }
    }

    fn is_expired(&self, request: &SessionRequest) -> bool {
        let deadline = request.enqueued_at
            + chrono::Duration::from_std(self.request_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() > deadline
    }

    fn remaining_budget(&self, request: &SessionRequest) -> Duration {
        let deadline = request.enqueued_at
            + chrono::Duration::from_std(self.request_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
impl SessionQueue for LocalSessionQueue {
    async fn add(&self, request: SessionRequest) -> Result<Value> {
        let id = request.request_id;
        let budget = self.remaining_budget(&request);
        if budget.is_zero() {
            return Err(GridError::RequestTimedOut {
                waited: self.request_timeout,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);
        self.queue.lock().await.push_back(request);
        self.bus.publish(GridEvent::NewSessionRequest(id))?;
        tracing::debug!(request_id = %id, "request queued");

        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(Ok(response))) => Ok(response.encoded),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_closed)) => Err(GridError::SessionNotCreated {
                message: "queue shut down while the request was pending".into(),
            }),
            Err(_elapsed) => {
                // Still queued? Then the timeout is ours to report. If a
                // scheduler already claimed it, that scheduler owns the
                // terminal event and we only unblock the caller.
                self.waiters.lock().await.remove(&id);
                let removed = {
                    let mut queue = self.queue.lock().await;
                    let before = queue.len();
                    queue.retain(|queued| queued.request_id != id);
                    queue.len() != before
                };
                if removed {
                    let _ = self.bus.publish(GridEvent::NewSessionRejected(NewSessionRejected {
                        request_id: id,
                        message: format!(
                            "new session request timed out after {:?} in queue",
                            self.request_timeout
                        ),
                    }));
                }
                Err(GridError::RequestTimedOut {
                    waited: self.request_timeout,
                })
            }
        }
    }

    async fn retry_add(&self, request: SessionRequest) -> Result<bool> {
        if self.is_expired(&request) {
            tracing::info!(request_id = %request.request_id, "refusing retry of expired request");
            return Ok(false);
        }

        let id = request.request_id;
        self.queue.lock().await.push_front(request);
        self.bus.publish(GridEvent::NewSessionRequest(id))?;
        tracing::debug!(request_id = %id, "request re-queued at head");
        Ok(true)
    }

    async fn remove(&self, id: RequestId) -> Result<Option<SessionRequest>> {
        let mut queue = self.queue.lock().await;
        let position = queue.iter().position(|request| request.request_id == id);
        Ok(position.and_then(|index| queue.remove(index)))
    }

    async fn clear(&self) -> Result<usize> {
        let drained: Vec<SessionRequest> = self.queue.lock().await.drain(..).collect();
        let count = drained.len();
        for request in drained {
            let _ = self.bus.publish(GridEvent::NewSessionRejected(NewSessionRejected {
                request_id: request.request_id,
                message: "session request queue was cleared".into(),
            }));
        }
        if count > 0 {
            tracing::info!(count, "queue cleared");
        }
        Ok(count)
    }

    async fn contents(&self) -> Result<Vec<Capabilities>> {
        Ok(self.queue.lock().await.iter().map(SessionRequest::first_choice).collect())
    }

    async fn is_ready(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}
