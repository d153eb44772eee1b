use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{Harness, assert_quiet, recv};
use crate::message::{CallOptions, MessageProperties};
use crate::queue::Received;

#[tokio::test]
async fn test_send_and_listen_round_trip() {
    let harness = Harness::new();
    let bus = harness.bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Received>();

    bus.listen("my.queue", CallOptions::default(), move |received| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(received);
            Ok(())
        }
    })
    .await
    .unwrap();
    bus.send("my.queue", json!({ "my": "event" }), CallOptions::default())
        .await
        .unwrap();

    let received = recv(&mut rx).await;
    assert_eq!(received.content, json!({ "my": "event" }));
    assert_eq!(received.message.fields.routing_key, "my.queue");
    assert_eq!(
        received.message.properties.content_type.as_deref(),
        Some("application/json")
    );
    assert!(received.message.handle.is_none());
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_package_envelope_round_trip() {
    let harness = Harness::new();
    let bus = harness.bus().await;
    bus.use_middleware(bus.package()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    bus.listen("my.packaged.queue", CallOptions::default(), move |received| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(received.content);
            Ok(())
        }
    })
    .await
    .unwrap();
    bus.send(
        "my.packaged.queue",
        json!({ "my": "event" }),
        CallOptions::default(),
    )
    .await
    .unwrap();

    let content = recv(&mut rx).await;
    assert_eq!(content["data"], json!({ "my": "event" }));
    assert_eq!(content["type"], "my.packaged.queue");
    assert!(content["datetime"].as_str().unwrap().ends_with("GMT"));
}

#[tokio::test]
async fn test_properties_pass_through() {
    let harness = Harness::new();
    let bus = harness.bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel::<MessageProperties>();

    bus.listen("with.props", CallOptions::default(), move |received| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(received.message.properties);
            Ok(())
        }
    })
    .await
    .unwrap();

    let options = CallOptions {
        message_type: Some("order.created".to_string()),
        ..CallOptions::default()
    }
    .with_correlation_id("cid-42")
    .with_header("tenant", json!("acme"));
    bus.send("with.props", json!({}), options).await.unwrap();

    let properties = recv(&mut rx).await;
    assert_eq!(properties.correlation_id.as_deref(), Some("cid-42"));
    assert_eq!(properties.message_type.as_deref(), Some("order.created"));
    assert_eq!(properties.headers["tenant"], json!("acme"));
    assert!(!properties.persistent);
}

#[tokio::test]
async fn test_acknowledged_sends_are_persistent() {
    let harness = Harness::new();
    let bus = harness.bus().await;

    bus.send("durable.jobs", json!({ "n": 1 }), CallOptions::ack())
        .await
        .unwrap();

    let declare = harness.broker.queue_declare("durable.jobs").unwrap();
    assert!(declare.durable);
    assert!(harness.broker.queue_exists("durable.jobs.error"));
    let delivery = harness.broker.get("durable.jobs").unwrap().unwrap();
    assert!(delivery.properties.persistent);
}

#[tokio::test]
async fn test_listeners_on_two_buses_compete() {
    let harness = Harness::new();
    let first = harness.bus().await;
    let second = harness.bus_with(harness.settings("second")).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, Value)>();

    for (name, bus) in [("first", &first), ("second", &second)] {
        let tx = tx.clone();
        bus.listen("work", CallOptions::ack(), move |received| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((name, received.content));
                Ok(())
            }
        })
        .await
        .unwrap();
    }

    first
        .send("work", json!({ "n": 1 }), CallOptions::ack())
        .await
        .unwrap();
    first
        .send("work", json!({ "n": 2 }), CallOptions::ack())
        .await
        .unwrap();

    let mut workers = vec![recv(&mut rx).await.0, recv(&mut rx).await.0];
    workers.sort();
    assert_eq!(workers, vec!["first", "second"]);
}

#[tokio::test]
async fn test_destroy_listener_removes_queues() {
    let harness = Harness::new();
    let bus = harness.bus().await;

    bus.listen("doomed", CallOptions::ack(), |_received| async { Ok(()) })
        .await
        .unwrap();
    assert!(harness.broker.queue_exists("doomed"));
    assert!(harness.broker.queue_exists("doomed.error"));

    bus.destroy_listener("doomed", false).await.unwrap();
    assert!(!harness.broker.queue_exists("doomed"));
    assert!(!harness.broker.queue_exists("doomed.error"));
    assert!(bus.unlisten("doomed").await.is_err());
}
