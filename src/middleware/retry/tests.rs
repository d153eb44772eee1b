use super::redis_store::{format_key, redis_url};
use super::*;
use crate::config::{BusSettings, RedisSettings};
use crate::message::{CallOptions, DeliveryFields, Message, MessageProperties, QueueOptions};
use crate::transport::{Channel, Consumer, ExchangeDeclare, QueueDeclare};
use crate::utils::BusError;
use serde_json::json;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Ack(u64),
    Reject(u64, bool),
    SendToQueue(String, Value, MessageProperties),
}

#[derive(Default)]
struct RecordingChannel {
    calls: Mutex<Vec<Call>>,
}

impl RecordingChannel {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn is_confirm(&self) -> bool {
        false
    }

    async fn prefetch(&self, _count: u16) -> Result<()> {
        Ok(())
    }

    async fn assert_queue(&self, _name: &str, _declare: &QueueDeclare) -> Result<()> {
        Ok(())
    }

    async fn assert_exchange(&self, _name: &str, _declare: &ExchangeDeclare) -> Result<()> {
        Ok(())
    }

    async fn bind_queue(&self, _queue: &str, _exchange: &str, _pattern: &str) -> Result<()> {
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        _no_ack: bool,
        _consumer: Arc<dyn Consumer>,
    ) -> Result<String> {
        Ok("ctag".to_string())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let content = serde_json::from_slice(&body)?;
        self.record(Call::SendToQueue(queue.to_string(), content, properties));
        Ok(())
    }

    async fn publish(
        &self,
        _exchange: &str,
        _routing_key: &str,
        _body: Vec<u8>,
        _properties: MessageProperties,
    ) -> Result<()> {
        Ok(())
    }

    async fn ack(&self, fields: &DeliveryFields) -> Result<()> {
        self.record(Call::Ack(fields.delivery_tag));
        Ok(())
    }

    async fn reject(&self, fields: &DeliveryFields, requeue: bool) -> Result<()> {
        self.record(Call::Reject(fields.delivery_tag, requeue));
        Ok(())
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_queue(&self, _name: &str, _if_empty: bool) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn delivery(
    channel: &Arc<RecordingChannel>,
    call: &CallOptions,
    tag: u64,
    redelivered: bool,
) -> IncomingMessage {
    let fields = DeliveryFields {
        delivery_tag: tag,
        redelivered,
        routing_key: "orders".to_string(),
        ..Default::default()
    };
    IncomingMessage {
        channel: channel.clone(),
        message: Message::new(
            json!({ "cid": "cid-1", "type": "order.created", "my": "event" }),
            fields,
            MessageProperties::default(),
        ),
        options: QueueOptions::with_defaults("orders", call, &BusSettings::default()),
    }
}

async fn instrument(
    retry: &RetryMiddleware,
    channel: &Arc<RecordingChannel>,
    call: &CallOptions,
    tag: u64,
    redelivered: bool,
) -> Message {
    let mut ctx = MessageContext::new();
    retry
        .handle_incoming(&mut ctx, delivery(channel, call, tag, redelivered))
        .await
        .unwrap()
        .message
}

#[tokio::test]
async fn test_unacknowledged_queues_pass_through() {
    let channel = Arc::new(RecordingChannel::default());
    let msg = instrument(
        &RetryMiddleware::new(),
        &channel,
        &CallOptions::default(),
        1,
        false,
    )
    .await;
    assert!(msg.handle.is_none());
    assert!(msg.content.get("retriesRemaining").is_none());
}

#[tokio::test]
async fn test_ack_twice_is_a_contract_violation() {
    let channel = Arc::new(RecordingChannel::default());
    let msg = instrument(&RetryMiddleware::new(), &channel, &CallOptions::ack(), 7, false).await;
    let handle = msg.handle.unwrap();

    handle.ack().await.unwrap();
    let err = handle.acknowledge().await.unwrap_err();
    assert!(err.is_contract_violation());
    assert_eq!(
        err.to_string(),
        "message type: order.created cid: cid-1 handle already called with ack"
    );
    assert_eq!(channel.calls(), vec![Call::Ack(7)]);
}

#[tokio::test]
async fn test_reject_beyond_max_is_a_contract_violation() {
    let channel = Arc::new(RecordingChannel::default());
    let store = Arc::new(MemoryStore::new());
    let retry = RetryMiddleware::from_settings(&Default::default(), store.clone());
    let msg = instrument(&retry, &channel, &CallOptions::ack().with_max_retries(3), 3, false).await;
    let handle = msg.handle.unwrap();

    handle.reject().await.unwrap();
    handle.reject().await.unwrap();
    handle.reject().await.unwrap();
    let err = handle.reject().await.unwrap_err();
    assert!(matches!(
        err,
        BusError::HandleAlreadyCalled {
            method: "reject",
            ..
        }
    ));

    assert_eq!(store.get("cid-1").await.unwrap(), 3);
    assert_eq!(channel.calls(), vec![Call::Reject(3, true); 3]);
}

#[tokio::test]
async fn test_fourth_rejection_dead_letters() {
    let channel = Arc::new(RecordingChannel::default());
    let store = Arc::new(MemoryStore::new());
    let retry = RetryMiddleware::from_settings(&Default::default(), store.clone());
    let call = CallOptions::ack().with_header("origin", json!("test"));

    for tag in 1..=4u64 {
        let msg = instrument(&retry, &channel, &call, tag, tag > 1).await;
        msg.handle.unwrap().reject().await.unwrap();
    }

    let calls = channel.calls();
    assert_eq!(calls.len(), 5);
    assert_eq!(
        calls[..3],
        [
            Call::Reject(1, true),
            Call::Reject(2, true),
            Call::Reject(3, true)
        ]
    );
    match &calls[3] {
        Call::SendToQueue(queue, content, properties) => {
            assert_eq!(queue, "orders.error");
            assert_eq!(content["my"], "event");
            assert_eq!(properties.headers["rejected"], json!(4));
            assert_eq!(properties.headers["origin"], json!("test"));
            assert!(properties.persistent);
        }
        other => panic!("expected dead-letter send, got {:?}", other),
    }
    assert_eq!(calls[4], Call::Reject(4, false));
    assert_eq!(store.get("cid-1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_zero_retries_dead_letters_on_first_reject() {
    let channel = Arc::new(RecordingChannel::default());
    let store = Arc::new(MemoryStore::new());
    let retry = RetryMiddleware::from_settings(&Default::default(), store.clone());
    let msg = instrument(&retry, &channel, &CallOptions::ack().with_max_retries(0), 9, false).await;
    let handle = msg.handle.unwrap();

    handle.reject().await.unwrap();
    assert!(handle.reject().await.unwrap_err().is_contract_violation());

    let calls = channel.calls();
    assert_eq!(calls.len(), 2);
    match &calls[0] {
        Call::SendToQueue(queue, _, properties) => {
            assert_eq!(queue, "orders.error");
            assert_eq!(properties.headers["rejected"], json!(1));
        }
        other => panic!("expected dead-letter send, got {:?}", other),
    }
    assert_eq!(calls[1], Call::Reject(9, false));
    assert_eq!(store.get("cid-1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_retries_remaining_counts_down() {
    let channel = Arc::new(RecordingChannel::default());
    let retry = RetryMiddleware::new().set_retries_remaining(true);
    let call = CallOptions::ack().with_max_retries(5);

    for n in 1..=6u64 {
        let msg = instrument(&retry, &channel, &call, n, n > 1).await;
        assert_eq!(msg.retries_remaining(), Some(5 - (n - 1)));
        msg.handle.unwrap().reject().await.unwrap();
    }
    assert!(matches!(
        channel.calls().last(),
        Some(Call::Reject(6, false))
    ));
}

#[tokio::test]
async fn test_namespaces_keep_counters_apart() {
    let channel = Arc::new(RecordingChannel::default());
    let store = Arc::new(MemoryStore::new());
    let first = RetryMiddleware::from_settings(&Default::default(), store.clone()).namespace("a");
    let second = RetryMiddleware::from_settings(&Default::default(), store.clone()).namespace("b");

    let a = instrument(&first, &channel, &CallOptions::ack(), 1, false).await;
    let b = instrument(&second, &channel, &CallOptions::ack(), 2, false).await;
    assert_eq!(a.handle.as_ref().unwrap().key(), "a-cid-1");
    assert_eq!(b.handle.as_ref().unwrap().key(), "b-cid-1");

    a.handle.as_ref().unwrap().reject().await.unwrap();
    b.handle.as_ref().unwrap().reject().await.unwrap();
    b.handle.as_ref().unwrap().reject().await.unwrap();
    assert_eq!(store.get("a-cid-1").await.unwrap(), 1);
    assert_eq!(store.get("b-cid-1").await.unwrap(), 2);

    store.clear("a-cid-1").await.unwrap();
    assert_eq!(store.get("a-cid-1").await.unwrap(), 0);
    assert_eq!(store.get("b-cid-1").await.unwrap(), 2);
}

#[tokio::test]
async fn test_ack_clears_retry_record() {
    let channel = Arc::new(RecordingChannel::default());
    let store = Arc::new(MemoryStore::new());
    let retry = RetryMiddleware::from_settings(&Default::default(), store.clone());

    let first = instrument(&retry, &channel, &CallOptions::ack(), 1, false).await;
    first.handle.unwrap().reject().await.unwrap();
    assert_eq!(store.get("cid-1").await.unwrap(), 1);

    let second = instrument(&retry, &channel, &CallOptions::ack(), 2, true).await;
    second.handle.unwrap().ack().await.unwrap();
    assert_eq!(store.get("cid-1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_memory_store_counts() {
    let store = MemoryStore::new();
    assert_eq!(store.get("k").await.unwrap(), 0);
    assert_eq!(store.increment("k").await.unwrap(), 1);
    assert_eq!(store.increment("k").await.unwrap(), 2);
    assert_eq!(store.get("k").await.unwrap(), 2);
    store.clear("k").await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), 0);
}

#[test]
fn test_redis_key_and_url_formatting() {
    assert_eq!(format_key("servicebus.retry.{}", "ns-1"), "servicebus.retry.ns-1");
    assert_eq!(format_key("retry:", "1"), "retry:1");

    let mut settings = RedisSettings::default();
    assert_eq!(redis_url(&settings), "redis://127.0.0.1:6379");
    settings.password = Some("p@ss".to_string());
    assert_eq!(redis_url(&settings), "redis://:p%40ss@127.0.0.1:6379");
}

#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_uncorrelated_message_warns_about_shared_counter() {
    let log = CapturedLog::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let log = log.clone();
            move || log.clone()
        })
        .with_ansi(false)
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let channel = Arc::new(RecordingChannel::default());
    let mut incoming = delivery(&channel, &CallOptions::ack(), 1, false);
    incoming.message = Message::new(
        json!({ "my": "event" }),
        incoming.message.fields.clone(),
        MessageProperties::default(),
    );
    let mut ctx = MessageContext::new();
    let msg = RetryMiddleware::new()
        .handle_incoming(&mut ctx, incoming)
        .await
        .unwrap()
        .message;

    assert_eq!(msg.handle.unwrap().key(), "");
    let output = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("retries share one counter"), "{}", output);
}
