use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::caps;
use crate::events::LocalEventBus;
use crate::node::factory::LoopbackSessionFactory;
use crate::testing::{FlakySessionFactory, RejectingSessionFactory, create_request};

fn test_bus() -> Arc<dyn EventBus> {
    Arc::new(LocalEventBus::new())
}

fn cheese_node(bus: Arc<dyn EventBus>, slot_count: usize) -> Arc<LocalNode> {
    LocalNode::builder("http://localhost:5555", bus)
        .heartbeat_period(Duration::from_secs(3600))
        .add_driver(caps! { "browserName" => "cheese" }, Arc::new(LoopbackSessionFactory), slot_count)
        .build()
}

#[tokio::test]
async fn new_session_fills_a_slot() {
    let node = cheese_node(test_bus(), 1);

    let outcome = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    let response = match outcome {
        NewSessionOutcome::Created(response) => response,
        other => panic!("expected created, got {other:?}"),
    };

    assert_eq!(response.session.uri, "http://localhost:5555");
    let status = node.status().await.unwrap();
    assert_eq!(status.active_sessions(), 1);
    assert!(!status.has_capacity());
}

#[tokio::test]
async fn concurrent_sessions_get_distinct_ids() {
    let node = cheese_node(test_bus(), 3);

    let (a, b, c) = tokio::join!(
        node.new_session(create_request(caps! { "browserName" => "cheese" })),
        node.new_session(create_request(caps! { "browserName" => "cheese" })),
        node.new_session(create_request(caps! { "browserName" => "cheese" })),
    );

    let mut ids = Vec::new();
    for outcome in [a, b, c] {
        match outcome {
            NewSessionOutcome::Created(response) => ids.push(response.session.id),
            other => panic!("expected created, got {other:?}"),
        }
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3, "session ids must be distinct");
}

#[tokio::test]
async fn busy_compatible_slots_ask_for_retry() {
    let node = cheese_node(test_bus(), 1);

    let first = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    assert!(matches!(first, NewSessionOutcome::Created(_)));

    let second = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    assert!(matches!(second, NewSessionOutcome::Retry { .. }));
}

#[tokio::test]
async fn unmatched_capabilities_are_rejected() {
    let node = cheese_node(test_bus(), 1);

    let outcome = node.new_session(create_request(caps! { "browserName" => "peas" })).await;
    assert!(matches!(outcome, NewSessionOutcome::Rejected { .. }));
}

#[tokio::test]
async fn retryable_factory_failure_is_a_retry() {
    let bus = test_bus();
    let node = LocalNode::builder("http://localhost:5555", bus)
        .heartbeat_period(Duration::from_secs(3600))
        .add_driver(caps! { "browserName" => "cheese" }, Arc::new(FlakySessionFactory::new(1)), 1)
        .build();

    let first = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    assert!(matches!(first, NewSessionOutcome::Retry { .. }));

    // The failed attempt must have released the slot.
    let second = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    assert!(matches!(second, NewSessionOutcome::Created(_)));
}

#[tokio::test]
async fn fatal_factory_failure_is_a_rejection() {
    let bus = test_bus();
    let node = LocalNode::builder("http://localhost:5555", bus)
        .heartbeat_period(Duration::from_secs(3600))
        .add_driver(
            caps! { "browserName" => "cheese" },
            Arc::new(RejectingSessionFactory::new("driver exploded")),
            1,
        )
        .build();

    let outcome = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    match outcome {
        NewSessionOutcome::Rejected { message } => assert_eq!(message, "driver exploded"),
        other => panic!("expected rejected, got {other:?}"),
    }

    let status = node.status().await.unwrap();
    assert!(status.has_capacity(), "slot must be freed after a fatal failure");
}

#[tokio::test]
async fn stop_frees_the_slot() {
    let node = cheese_node(test_bus(), 1);

    let outcome = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    let session_id = match outcome {
        NewSessionOutcome::Created(response) => response.session.id,
        other => panic!("expected created, got {other:?}"),
    };

    node.stop(&session_id).await.unwrap();
    let status = node.status().await.unwrap();
    assert_eq!(status.active_sessions(), 0);
    assert!(status.has_capacity());
}

#[tokio::test]
async fn stop_unknown_session_is_an_error() {
    let node = cheese_node(test_bus(), 1);
    let err = node.stop(&SessionId::new()).await.unwrap_err();
    assert!(matches!(err, GridError::NoSuchSession { .. }));
}

#[tokio::test]
async fn commands_reach_the_session() {
    let node = cheese_node(test_bus(), 1);

    let outcome = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    let session_id = match outcome {
        NewSessionOutcome::Created(response) => response.session.id,
        other => panic!("expected created, got {other:?}"),
    };

    let response = node
        .execute_webdriver_command(
            &session_id,
            CommandRequest {
                method: "GET".into(),
                path: "/url".into(),
                body: serde_json::Value::Null,
            },
        )
        .await
        .unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn drain_refuses_new_sessions_and_completes() {
    let bus = Arc::new(LocalEventBus::new());
    let mut events = bus.subscribe();
    let node = cheese_node(bus.clone(), 1);

    let outcome = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    let session_id = match outcome {
        NewSessionOutcome::Created(response) => response.session.id,
        other => panic!("expected created, got {other:?}"),
    };

    node.drain().await.unwrap();
    assert!(node.is_draining());

    let refused = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    assert!(matches!(refused, NewSessionOutcome::Rejected { .. }));

    // Draining completes when the last session ends.
    node.stop(&session_id).await.unwrap();
    let drained_id = loop {
        match events.recv().await.unwrap() {
            GridEvent::NodeDrainComplete(id) => break id,
            _ => continue,
        }
    };
    assert_eq!(drained_id, node.id());
}

#[tokio::test]
async fn drain_with_no_sessions_completes_immediately() {
    let bus = Arc::new(LocalEventBus::new());
    let mut events = bus.subscribe();
    let node = cheese_node(bus.clone(), 1);

    node.drain().await.unwrap();
    let drained_id = loop {
        match events.recv().await.unwrap() {
            GridEvent::NodeDrainComplete(id) => break id,
            _ => continue,
        }
    };
    assert_eq!(drained_id, node.id());
}

#[tokio::test]
async fn idle_sessions_are_expired() {
    let bus = test_bus();
    let node = LocalNode::builder("http://localhost:5555", bus)
        .heartbeat_period(Duration::from_secs(3600))
        .session_timeout(Duration::from_millis(0))
        .add_driver(caps! { "browserName" => "cheese" }, Arc::new(LoopbackSessionFactory), 1)
        .build();

    let outcome = node.new_session(create_request(caps! { "browserName" => "cheese" })).await;
    assert!(matches!(outcome, NewSessionOutcome::Created(_)));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let expired = node.expire_idle_sessions().await;
    assert_eq!(expired.len(), 1);

    let status = node.status().await.unwrap();
    assert_eq!(status.active_sessions(), 0);
}

#[tokio::test]
async fn status_round_trips_through_json() {
    let node = cheese_node(test_bus(), 2);
    let status = node.status().await.unwrap();

    let json = serde_json::to_string(&status).unwrap();
    let back: NodeStatus = serde_json::from_str(&json).unwrap();
    assert_eq!(status, back);
}

#[tokio::test]
async fn health_check_reports_draining() {
    let node = cheese_node(test_bus(), 1);
    assert_eq!(node.health_check().await.availability, Availability::Up);

    node.drain().await.unwrap();
    assert_eq!(node.health_check().await.availability, Availability::Draining);
}
