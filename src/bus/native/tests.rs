//! Tests for the native bus against an in-process coordinator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use serial_test::serial;

use super::*;
use crate::broker::Coordinator;
use crate::bus::Payload;

const WAIT: Duration = Duration::from_secs(1);

fn connect(coordinator: &Coordinator) -> NativeBus {
    NativeBus::new(Arc::new(coordinator.role()))
}

async fn recv_payload(queue: &dyn PullQueue) -> Payload {
    tokio::time::timeout(WAIT, queue.recv())
        .await
        .expect("timed out waiting for work item")
        .expect("pull queue closed")
}

#[tokio::test]
#[serial(coordinator)]
async fn test_operations_wait_for_open() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);

    let push = bus.create_push_queue("jobs").await.unwrap();
    let pull = bus.create_pull_queue("jobs").await.unwrap();
    push.publish(json!("first")).await.unwrap();
    push.publish(json!("second")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(coordinator.work_queue("jobs").worker_count(), 0);
    assert!(!bus.is_open());

    bus.open().await.unwrap();
    assert_eq!(recv_payload(pull.as_ref()).await, json!("first"));
    assert_eq!(recv_payload(pull.as_ref()).await, json!("second"));
}

#[tokio::test]
#[serial(coordinator)]
async fn test_invalid_topic_is_reported_immediately() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);

    let publisher = bus.create_publish_queue("orders").await.unwrap();
    let err = publisher.publish(json!(1), Some("orders.")).await.unwrap_err();
    assert!(matches!(err, BusError::InvalidTopic { ref topic } if topic == "orders."));

    let subscriber = bus.create_subscribe_queue("orders").await.unwrap();
    assert!(matches!(
        subscriber.subscribe(Some("a..b")).await,
        Err(BusError::InvalidTopic { .. })
    ));
}

#[tokio::test]
#[serial(coordinator)]
async fn test_no_underlying_queue_after_coordinator_is_gone() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);
    let push = bus.create_push_queue("jobs").await.unwrap();
    drop(coordinator);

    assert!(matches!(
        push.publish(json!(1)).await,
        Err(BusError::NoUnderlyingQueue { ref name }) if name == "jobs"
    ));
    assert!(matches!(
        bus.create_pull_queue("jobs").await,
        Err(BusError::NoUnderlyingQueue { .. })
    ));
}

#[tokio::test]
#[serial(coordinator)]
async fn test_subscribe_and_publish() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);
    bus.open().await.unwrap();

    let subscriber = bus.create_subscribe_queue("orders").await.unwrap();
    subscriber.subscribe(Some("orders.urgent")).await.unwrap();
    let publisher = bus.create_publish_queue("orders").await.unwrap();

    publisher.publish(json!("skip"), Some("orders.normal")).await.unwrap();
    publisher
        .publish(json!({"id": 1}), Some("orders.urgent.retry"))
        .await
        .unwrap();

    let delivery = tokio::time::timeout(WAIT, subscriber.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.topic, "orders.urgent.retry");
    assert_eq!(delivery.payload, json!({"id": 1}));
}

#[tokio::test]
#[serial(coordinator)]
async fn test_unsubscribe_twice_is_noop() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);
    bus.open().await.unwrap();

    let subscriber = bus.create_subscribe_queue("orders").await.unwrap();
    let id = subscriber.subscribe(None).await.unwrap();
    bus.flush().await;
    assert_eq!(coordinator.topic_queue("orders").subscriber_count(), 1);

    subscriber.unsubscribe(id).await.unwrap();
    subscriber.unsubscribe(id).await.unwrap();
    bus.flush().await;
    assert_eq!(coordinator.topic_queue("orders").subscriber_count(), 0);
}

#[tokio::test]
#[serial(coordinator)]
async fn test_pull_close_is_idempotent_and_ends_recv() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);
    bus.open().await.unwrap();

    let pull = bus.create_pull_queue("jobs").await.unwrap();
    bus.flush().await;
    assert_eq!(coordinator.work_queue("jobs").worker_count(), 1);

    pull.close().await.unwrap();
    pull.close().await.unwrap();
    bus.flush().await;
    assert_eq!(coordinator.work_queue("jobs").worker_count(), 0);

    let end = tokio::time::timeout(WAIT, pull.recv()).await.unwrap();
    assert_eq!(end, None);
}

#[tokio::test]
#[serial(coordinator)]
async fn test_dropping_facades_releases_them() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);
    bus.open().await.unwrap();

    {
        let pull = bus.create_pull_queue("jobs").await.unwrap();
        let subscriber = bus.create_subscribe_queue("orders").await.unwrap();
        subscriber.subscribe(None).await.unwrap();
        bus.flush().await;
        assert_eq!(pull.name(), "jobs");
    }

    bus.flush().await;
    assert_eq!(coordinator.work_queue("jobs").worker_count(), 0);
    assert_eq!(coordinator.topic_queue("orders").subscriber_count(), 0);
}

#[tokio::test]
#[serial(coordinator)]
async fn test_close_releases_everything_and_rejects_later_calls() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);
    bus.open().await.unwrap();

    let push = bus.create_push_queue("jobs").await.unwrap();
    let _pull = bus.create_pull_queue("jobs").await.unwrap();
    let subscriber = bus.create_subscribe_queue("orders").await.unwrap();
    subscriber.subscribe(None).await.unwrap();
    subscriber.subscribe(Some("orders")).await.unwrap();
    bus.flush().await;
    assert_eq!(coordinator.topic_queue("orders").subscriber_count(), 2);

    bus.close().await.unwrap();
    assert!(bus.is_closed());
    assert_eq!(coordinator.work_queue("jobs").worker_count(), 0);
    assert_eq!(coordinator.topic_queue("orders").subscriber_count(), 0);

    assert!(matches!(push.publish(json!(1)).await, Err(BusError::Closed)));
    assert!(matches!(
        bus.create_push_queue("jobs").await,
        Err(BusError::Closed)
    ));
    assert!(matches!(bus.open().await, Err(BusError::Closed)));

    // Second close and facade closes after the connection are no-ops.
    bus.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
#[serial(coordinator)]
async fn test_close_unopened_runs_queued_operations() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);

    let push = bus.create_push_queue("jobs").await.unwrap();
    push.publish(json!(1)).await.unwrap();
    bus.close().await.unwrap();

    assert_eq!(coordinator.work_queue("jobs").buffered(), 1);
}

#[tokio::test]
#[serial(coordinator)]
async fn test_closed_producers_reject_publish() {
    let coordinator = Coordinator::new().unwrap();
    let bus = connect(&coordinator);
    bus.open().await.unwrap();

    let push = bus.create_push_queue("jobs").await.unwrap();
    let publisher = bus.create_publish_queue("orders").await.unwrap();
    push.close().await.unwrap();
    push.close().await.unwrap();
    publisher.close().await.unwrap();

    assert!(matches!(push.publish(json!(1)).await, Err(BusError::Closed)));
    assert!(matches!(
        publisher.publish(json!(1), Some("orders")).await,
        Err(BusError::Closed)
    ));
    bus.flush().await;
    assert_eq!(coordinator.work_queue("jobs").buffered(), 0);

    // Other facades on the connection are unaffected.
    let again = bus.create_push_queue("jobs").await.unwrap();
    again.publish(json!(2)).await.unwrap();
    bus.flush().await;
    assert_eq!(coordinator.work_queue("jobs").buffered(), 1);
}
