use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::caps;
use crate::events::LocalEventBus;
use crate::node::LocalNode;
use crate::queue::LocalSessionQueue;
use crate::sessionmap::LocalSessionMap;
use crate::node::factory::LoopbackSessionFactory;
use crate::testing::FlakySessionFactory;
use crate::session::Dialect;

struct Grid {
    bus: Arc<LocalEventBus>,
    sessions: Arc<LocalSessionMap>,
    queue: Arc<LocalSessionQueue>,
    distributor: Arc<LocalDistributor>,
}

fn grid() -> Grid {
    let bus = Arc::new(LocalEventBus::new());
    let sessions = LocalSessionMap::new(bus.clone());
    let queue = LocalSessionQueue::new(bus.clone(), Duration::from_secs(5), Duration::from_millis(50));
    let distributor = LocalDistributor::new(
        bus.clone(),
        sessions.clone(),
        queue.clone(),
        Secret::none(),
        Duration::from_secs(300),
        Duration::from_secs(120),
    );
    Grid {
        bus,
        sessions,
        queue,
        distributor,
    }
}

fn cheese_node(grid: &Grid, slot_count: usize) -> Arc<LocalNode> {
    LocalNode::builder("http://localhost:5555", grid.bus.clone())
        .heartbeat_period(Duration::from_secs(3600))
        .add_driver(caps! { "browserName" => "cheese" }, Arc::new(LoopbackSessionFactory), slot_count)
        .build()
}

fn cheese_request() -> SessionRequest {
    SessionRequest::new(vec![Dialect::W3c], vec![caps! { "browserName" => "cheese" }])
}

#[tokio::test]
async fn added_node_appears_in_status() {
    let grid = grid();
    let node = cheese_node(&grid, 1);

    grid.distributor.add(node.clone()).await.unwrap();

    let status = grid.distributor.status().await;
    assert_eq!(status.nodes.len(), 1);
    assert_eq!(status.nodes[0].uri, "http://localhost:5555");
}

#[tokio::test]
async fn duplicate_registration_is_idempotent() {
    let grid = grid();
    let node = cheese_node(&grid, 1);

    grid.distributor.add(node.clone()).await.unwrap();
    grid.distributor.add(node.clone()).await.unwrap();

    assert_eq!(grid.distributor.status().await.nodes.len(), 1);
}

#[tokio::test]
async fn removed_node_disappears_from_status() {
    let grid = grid();
    let node = cheese_node(&grid, 1);

    grid.distributor.add(node.clone()).await.unwrap();
    grid.distributor.remove(node.id()).await;

    assert!(grid.distributor.status().await.nodes.is_empty());
}

#[tokio::test]
async fn node_status_event_registers_the_node() {
    let grid = grid();
    let node = cheese_node(&grid, 1);
    let status = node.status().await.unwrap();

    grid.bus.publish(GridEvent::NodeStatus(status.clone())).unwrap();

    for _ in 0..100 {
        if grid.distributor.status().await.nodes.len() == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node was not registered from its status event");
}

#[tokio::test]
async fn heartbeat_from_unknown_node_registers_it() {
    let grid = grid();
    let node = cheese_node(&grid, 1);
    let status = node.status().await.unwrap();

    grid.bus.publish(GridEvent::NodeHeartBeat(status)).unwrap();

    for _ in 0..100 {
        if grid.distributor.status().await.nodes.len() == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node was not registered from its heartbeat");
}

#[tokio::test]
async fn queued_request_is_matched_to_a_slot() {
    let grid = grid();
    let node = cheese_node(&grid, 1);
    grid.distributor.add(node.clone()).await.unwrap();

    let encoded = grid.queue.add(cheese_request()).await.unwrap();
    let session_id = encoded["value"]["sessionId"].as_str().unwrap();

    // The session is routable the moment the client hears about it.
    let uri = grid
        .sessions
        .get_uri(&crate::session::SessionId::from_string(session_id))
        .await
        .unwrap();
    assert_eq!(uri, "http://localhost:5555");

    // And the model shows the slot as busy.
    let status = grid.distributor.status().await;
    assert_eq!(status.nodes[0].active_sessions(), 1);
}

#[tokio::test]
async fn retryable_failure_requeues_at_head_then_succeeds() {
    let grid = grid();
    let node = LocalNode::builder("http://localhost:5555", grid.bus.clone())
        .heartbeat_period(Duration::from_secs(3600))
        .add_driver(
            caps! { "browserName" => "cheese" },
            Arc::new(FlakySessionFactory::new(1)),
            1,
        )
        .build();
    grid.distributor.add(node.clone()).await.unwrap();

    // First attempt bounces retryably, the retry lands on the freed slot.
    let encoded = grid.queue.add(cheese_request()).await.unwrap();
    assert!(encoded["value"]["sessionId"].is_string());
}

#[tokio::test]
async fn unmatchable_request_is_rejected() {
    let grid = grid();
    let node = cheese_node(&grid, 1);
    grid.distributor.add(node.clone()).await.unwrap();

    let request = SessionRequest::new(vec![Dialect::W3c], vec![caps! { "browserName" => "peas" }]);
    let err = grid.queue.add(request).await.unwrap_err();
    assert!(matches!(err, GridError::SessionNotCreated { .. }));
}

#[tokio::test]
async fn capability_choices_are_tried_in_order() {
    let grid = grid();
    let node = cheese_node(&grid, 1);
    grid.distributor.add(node.clone()).await.unwrap();

    // First choice is unmatchable, second matches the cheese slot.
    let request = SessionRequest::new(
        vec![Dialect::W3c],
        vec![caps! { "browserName" => "peas" }, caps! { "browserName" => "cheese" }],
    );
    let outcome = grid.distributor.new_session(request).await;
    match outcome {
        NewSessionOutcome::Created(response) => {
            assert_eq!(
                response.session.capabilities.browser_name(),
                Some("cheese")
            );
        }
        other => panic!("expected created, got {other:?}"),
    }
}

#[tokio::test]
async fn drain_completes_and_node_is_removed() {
    let grid = grid();
    let node = cheese_node(&grid, 1);
    grid.distributor.add(node.clone()).await.unwrap();

    let draining = grid.distributor.drain(node.id()).await.unwrap();
    assert!(draining);
    assert!(node.is_draining());

    // An idle drained node finishes immediately and the distributor drops it.
    for _ in 0..100 {
        if grid.distributor.status().await.nodes.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("drained node was never removed");
}

#[tokio::test]
async fn no_reservation_succeeds_while_draining() {
    let grid = grid();
    let node = cheese_node(&grid, 2);
    grid.distributor.add(node.clone()).await.unwrap();

    // Occupy one slot so the drain stays in progress.
    let outcome = grid.distributor.new_session(cheese_request()).await;
    assert!(matches!(outcome, NewSessionOutcome::Created(_)));

    grid.distributor.drain(node.id()).await.unwrap();

    let outcome = grid.distributor.new_session(cheese_request()).await;
    assert!(
        !matches!(outcome, NewSessionOutcome::Created(_)),
        "no reservation may succeed on a draining node"
    );
}

#[tokio::test]
async fn drain_of_unknown_node_is_an_error() {
    let grid = grid();
    let err = grid.distributor.drain(NodeId::new()).await.unwrap_err();
    assert!(matches!(err, GridError::NoSuchNode { .. }));
}

#[tokio::test]
async fn purge_drops_silent_nodes_and_their_checks() {
    let bus = Arc::new(LocalEventBus::new());
    let sessions = LocalSessionMap::new(bus.clone());
    let queue = LocalSessionQueue::new(bus.clone(), Duration::from_secs(5), Duration::from_millis(50));
    let distributor = LocalDistributor::new(
        bus.clone(),
        sessions,
        queue,
        Secret::none(),
        Duration::from_secs(300),
        Duration::ZERO,
    );

    let node = LocalNode::builder("http://localhost:5555", bus.clone())
        .heartbeat_period(Duration::from_secs(3600))
        .add_driver(caps! { "browserName" => "cheese" }, Arc::new(LoopbackSessionFactory), 1)
        .build();
    distributor.add(node.clone()).await.unwrap();
    assert_eq!(distributor.status().await.nodes.len(), 1);

    tokio::time::sleep(Duration::from_millis(5)).await;
    distributor.purge_dead_nodes().await;
    assert!(distributor.status().await.nodes.is_empty());
    assert!(distributor.health_checks.lock().await.is_empty());
}

#[tokio::test]
async fn distributor_is_ready_with_local_components() {
    let grid = grid();
    assert!(grid.distributor.is_ready().await);
}

#[tokio::test]
async fn session_and_model_agree_after_creation() {
    let grid = grid();
    let node = cheese_node(&grid, 1);
    grid.distributor.add(node.clone()).await.unwrap();

    let outcome = grid.distributor.new_session(cheese_request()).await;
    let session = match outcome {
        NewSessionOutcome::Created(response) => response.session,
        other => panic!("expected created, got {other:?}"),
    };

    // Invariant: a busy slot implies a session-map binding to the same URI.
    let status = grid.distributor.status().await;
    let bound = status.nodes[0]
        .slots
        .iter()
        .find_map(|slot| slot.session.as_ref())
        .expect("slot must record the session");
    assert_eq!(bound.id, session.id);
    assert_eq!(grid.sessions.get_uri(&session.id).await.unwrap(), status.nodes[0].uri);
}

#[tokio::test]
async fn status_snapshot_round_trips_through_json() {
    let grid = grid();
    let node = cheese_node(&grid, 2);
    grid.distributor.add(node.clone()).await.unwrap();

    let status = grid.distributor.status().await;
    let json = serde_json::to_string(&status).unwrap();
    let back: DistributorStatus = serde_json::from_str(&json).unwrap();
    assert_eq!(status.nodes, back.nodes);
}
