//! Integration tests for the registration-secret filter.
//!
//! Every intra-cluster mutation must carry the shared secret; public
//! client-facing operations must not. These tests run the real routers on
//! ephemeral ports and knock on them with right, wrong and missing secrets.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;

use trellis::caps;
use trellis::distributor::remote::RemoteDistributor;
use trellis::distributor::{LocalDistributor, service as distributor_service};
use trellis::error::GridError;
use trellis::events::LocalEventBus;
use trellis::node::factory::LoopbackSessionFactory;
use trellis::node::{LocalNode, Node, NodeStatus, service as node_service};
use trellis::queue::{LocalSessionQueue, service as queue_service};
use trellis::server::{REGISTRATION_SECRET_HEADER, Secret};
use trellis::sessionmap::LocalSessionMap;

async fn spawn_server(router: Router) -> (String, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });
    (format!("http://{addr}"), cancel)
}

fn secured_distributor(secret: Secret) -> Arc<LocalDistributor> {
    let bus = Arc::new(LocalEventBus::new());
    let sessions = LocalSessionMap::new(bus.clone());
    let queue = LocalSessionQueue::new(bus.clone(), Duration::from_secs(5), Duration::from_millis(50));
    LocalDistributor::new(
        bus,
        sessions,
        queue,
        secret,
        Duration::from_secs(300),
        Duration::from_secs(120),
    )
}

fn cheese_node() -> Arc<LocalNode> {
    let bus = Arc::new(LocalEventBus::new());
    LocalNode::builder("http://localhost:5555", bus)
        .heartbeat_period(Duration::from_secs(3600))
        .add_driver(caps! { "browserName" => "cheese" }, Arc::new(LoopbackSessionFactory), 1)
        .build()
}

async fn cheese_status() -> NodeStatus {
    cheese_node().status().await.unwrap()
}

#[tokio::test]
async fn node_registration_with_wrong_secret_is_rejected() {
    let distributor = secured_distributor(Secret::new("right"));
    let (uri, _cancel) =
        spawn_server(distributor_service::router(distributor.clone(), Secret::new("right"))).await;

    let remote = RemoteDistributor::new(uri, Secret::new("wrong"));
    let err = remote.register(&cheese_status().await).await.unwrap_err();
    assert!(matches!(err, GridError::UnauthorizedSecret));

    assert_eq!(distributor.status().await.nodes.len(), 0);
}

#[tokio::test]
async fn node_registration_with_right_secret_succeeds() {
    let distributor = secured_distributor(Secret::new("right"));
    let (uri, _cancel) =
        spawn_server(distributor_service::router(distributor.clone(), Secret::new("right"))).await;

    let remote = RemoteDistributor::new(uri, Secret::new("right"));
    remote.register(&cheese_status().await).await.unwrap();

    assert_eq!(distributor.status().await.nodes.len(), 1);
}

#[tokio::test]
async fn missing_secret_is_rejected_like_a_wrong_one() {
    let distributor = secured_distributor(Secret::new("right"));
    let (uri, _cancel) =
        spawn_server(distributor_service::router(distributor.clone(), Secret::new("right"))).await;

    let response = reqwest::Client::new()
        .post(format!("{uri}/se/grid/distributor/node"))
        .json(&cheese_status().await)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn queue_mutations_require_the_secret() {
    let bus = Arc::new(LocalEventBus::new());
    let queue = LocalSessionQueue::new(bus, Duration::from_secs(5), Duration::from_millis(50));
    let (uri, _cancel) = spawn_server(queue_service::router(queue, Secret::new("right"))).await;

    let client = reqwest::Client::new();

    // Clearing without the secret bounces.
    let response = client
        .delete(format!("{uri}/se/grid/newsessionqueuer/queue"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    // With the secret it answers.
    let response = client
        .delete(format!("{uri}/se/grid/newsessionqueuer/queue"))
        .header(REGISTRATION_SECRET_HEADER, "right")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let dropped: usize = response.json().await.unwrap();
    assert_eq!(dropped, 0);
}

#[tokio::test]
async fn queue_reads_stay_public() {
    let bus = Arc::new(LocalEventBus::new());
    let queue = LocalSessionQueue::new(bus, Duration::from_secs(5), Duration::from_millis(50));
    let (uri, _cancel) = spawn_server(queue_service::router(queue, Secret::new("right"))).await;

    let response = reqwest::Client::new()
        .get(format!("{uri}/se/grid/newsessionqueuer/queue"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn node_drain_requires_the_secret() {
    let node = cheese_node();
    let (uri, _cancel) = spawn_server(node_service::router(node.clone(), Secret::new("right"))).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{uri}/se/grid/node/drain"))
        .header(REGISTRATION_SECRET_HEADER, "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
    assert!(!node.is_draining());

    let response = client
        .post(format!("{uri}/se/grid/node/drain"))
        .header(REGISTRATION_SECRET_HEADER, "right")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert!(node.is_draining());
}

#[tokio::test]
async fn session_map_mutations_require_the_secret() {
    let bus = Arc::new(LocalEventBus::new());
    let sessions = LocalSessionMap::new(bus);
    let (uri, _cancel) = spawn_server(trellis::sessionmap::service::router(
        sessions,
        Secret::new("right"),
    ))
    .await;

    let session = trellis::session::Session {
        id: trellis::session::SessionId::new(),
        uri: "http://localhost:5555".into(),
        stereotype: caps! { "browserName" => "cheese" },
        capabilities: caps! { "browserName" => "cheese" },
        started_at: chrono::Utc::now(),
    };

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{uri}/se/grid/sessions"))
        .json(&session)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = client
        .post(format!("{uri}/se/grid/sessions"))
        .header(REGISTRATION_SECRET_HEADER, "right")
        .json(&session)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);

    // Lookups stay public so the router can resolve sessions.
    let response = client
        .get(format!("{uri}/se/grid/sessions/{}", session.id))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}
