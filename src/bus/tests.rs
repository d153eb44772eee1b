use super::*;
use crate::config::BusSettings;
use crate::message::CallOptions;
use crate::queue::Cancellation;
use crate::transport::{MemoryBroker, Transport};
use crate::utils::BusError;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

fn settings(dir: &TempDir) -> BusSettings {
    BusSettings {
        queues_file: Some(dir.path().join("queues").display().to_string()),
        ..Default::default()
    }
}

async fn connect(broker: &MemoryBroker, settings: BusSettings) -> Arc<Bus> {
    Bus::connect(settings, Arc::new(broker.connect()))
        .await
        .unwrap()
}

async fn next_event(events: &mut broadcast::Receiver<BusEvent>) -> BusEvent {
    timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for event")
        .unwrap()
}

#[tokio::test]
async fn test_calls_before_initialize_run_in_order() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let bus = Bus::new(settings(&dir), Arc::new(broker.connect()));
    let mut events = bus.events();
    assert!(!bus.is_ready());

    let (first, second, ready) = tokio::join!(
        bus.send("ordered", json!({ "n": 1 }), CallOptions::default()),
        bus.send("ordered", json!({ "n": 2 }), CallOptions::default()),
        bus.initialize(),
    );
    first.unwrap();
    second.unwrap();
    ready.unwrap();
    assert!(bus.is_ready());
    assert!(matches!(next_event(&mut events).await, BusEvent::Ready));

    let bodies: Vec<Value> = std::iter::from_fn(|| broker.get("ordered").unwrap())
        .map(|delivery| serde_json::from_slice(&delivery.body).unwrap())
        .collect();
    assert_eq!(bodies, vec![json!({ "n": 1 }), json!({ "n": 2 })]);
}

#[tokio::test]
async fn test_failed_initialize_is_reported() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let conn = Arc::new(broker.connect());
    conn.force_close("CONNECTION_FORCED").unwrap();

    let bus = Bus::new(settings(&dir), conn);
    let mut events = bus.events();
    assert!(matches!(bus.initialize().await, Err(BusError::Closed)));
    assert!(matches!(
        next_event(&mut events).await,
        BusEvent::Error(err) if matches!(*err, BusError::Closed)
    ));

    let err = bus
        .send("orders", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Transport(_)));
}

#[tokio::test]
async fn test_confirmed_send_requires_confirms() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let plain = connect(&broker, settings(&dir)).await;
    let err = plain
        .send_confirmed("orders", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ConfirmsNotEnabled));
    let err = plain
        .publish_confirmed("orders", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ConfirmsNotEnabled));

    let confirming = connect(
        &broker,
        BusSettings {
            enable_confirms: true,
            ..settings(&dir)
        },
    )
    .await;
    confirming
        .send_confirmed("confirmed", json!({ "ok": true }), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.message_count("confirmed"), Some(1));
}

#[tokio::test]
async fn test_connection_events_are_forwarded() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let conn = Arc::new(broker.connect());
    let bus = Bus::connect(settings(&dir), conn.clone()).await.unwrap();
    let mut events = bus.events();

    conn.force_close("CONNECTION_FORCED").unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        BusEvent::ConnectionError(reason) if reason == "CONNECTION_FORCED"
    ));
    assert!(matches!(
        next_event(&mut events).await,
        BusEvent::ChannelClose { confirm: false }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        BusEvent::ChannelClose { confirm: false }
    ));
    assert!(matches!(next_event(&mut events).await, BusEvent::ConnectionClose));
}

#[tokio::test]
async fn test_close_stops_further_operations() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let bus = connect(&broker, settings(&dir)).await;
    let mut events = bus.events();

    bus.close().await.unwrap();
    bus.close().await.unwrap();
    assert!(!bus.is_ready());

    let mut closed = false;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if matches!(event, BusEvent::ConnectionClose) {
            closed = true;
            break;
        }
    }
    assert!(closed);

    let err = bus
        .publish("orders", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Closed));
}

#[tokio::test]
async fn test_unlisten_and_destroy_unknown_queue() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let bus = connect(&broker, settings(&dir)).await;

    assert!(matches!(
        bus.unlisten("nobody").await,
        Err(BusError::NoListener(queue)) if queue == "nobody"
    ));
    assert!(matches!(
        bus.destroy_listener("nobody", false).await,
        Err(BusError::NoListener(_))
    ));

    bus.send("stray", json!({}), CallOptions::ack()).await.unwrap();
    assert!(broker.queue_exists("stray"));
    bus.destroy_listener("ghost", true).await.unwrap();

    let other = connect(&broker, settings(&dir)).await;
    other.destroy_listener("stray", true).await.unwrap();
    assert!(!broker.queue_exists("stray"));
}

#[tokio::test]
async fn test_unlisten_then_listen_again() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let bus = connect(&broker, settings(&dir)).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = tx.clone();
    bus.listen("jobs", CallOptions::ack(), move |received| {
        let first = first.clone();
        async move {
            let _ = first.send(("first", received.content));
            Ok(())
        }
    })
    .await
    .unwrap();
    assert_eq!(bus.unlisten("jobs").await.unwrap(), Cancellation::Cancelled(1));

    bus.listen("jobs", CallOptions::ack(), move |received| {
        let second = tx.clone();
        async move {
            let _ = second.send(("second", received.content));
            Ok(())
        }
    })
    .await
    .unwrap();
    bus.send("jobs", json!({ "n": 1 }), CallOptions::ack())
        .await
        .unwrap();

    let (who, content) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(who, "second");
    assert_eq!(content, json!({ "n": 1 }));
}

#[tokio::test]
async fn test_use_middleware_chains() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let bus = connect(&broker, settings(&dir)).await;

    bus.use_middleware(bus.package())
        .unwrap()
        .use_middleware(bus.correlate())
        .unwrap()
        .use_middleware(bus.retry())
        .unwrap();

    bus.send("wrapped", json!({ "my": "event" }), CallOptions::default())
        .await
        .unwrap();
    let delivery = broker.get("wrapped").unwrap().unwrap();
    let body: Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(body["data"], json!({ "my": "event" }));
    assert_eq!(body["type"], "wrapped");
    assert!(body["cid"].is_string());
}

#[tokio::test]
async fn test_create_correlation_id() {
    let dir = TempDir::new().unwrap();
    let bus = Bus::new(settings(&dir), Arc::new(MemoryBroker::new().connect()));
    let ctx = crate::middleware::MessageContext::new().with_correlation_id("known");

    assert_eq!(bus.create_correlation_id(Some(&ctx), false), "known");
    assert_ne!(bus.create_correlation_id(Some(&ctx), true), "known");
    let fresh = bus.create_correlation_id(None, false);
    assert!(!fresh.is_empty());
    assert_ne!(fresh, bus.create_correlation_id(None, false));
}

#[tokio::test]
async fn test_registry_reuses_named_bus() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let registry = BusRegistry::new();
    let connects = Arc::new(AtomicUsize::new(0));

    let open = || {
        let connects = connects.clone();
        let settings = settings(&dir);
        let transport: Arc<dyn Transport> = Arc::new(broker.connect());
        async move {
            connects.fetch_add(1, Ordering::SeqCst);
            Bus::connect(settings, transport).await
        }
    };

    let a = registry.named("orders", open).await.unwrap();
    let b = registry.named("orders", open).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    let failed = registry
        .named("broken", || async { Err(BusError::transport("refused")) })
        .await;
    assert!(failed.is_err());
    assert!(registry.get("broken").await.is_none());

    let removed = registry.remove("orders").await.unwrap();
    assert!(Arc::ptr_eq(&removed, &a));
    let c = registry.named("orders", open).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}
