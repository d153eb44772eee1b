use super::{CallOptions, Codec, JsonCodec, Message, QueueKind, QueueOptions};
use crate::config::BusSettings;
use serde_json::json;

#[test]
fn test_ack_makes_queue_durable_and_persistent() {
    let opts = QueueOptions::with_defaults("orders", &CallOptions::ack(), &BusSettings::default());
    assert!(opts.ack);
    assert!(opts.durable);
    assert!(opts.persistent);
    assert!(!opts.auto_delete);
    assert!(!opts.exclusive);
    assert_eq!(opts.content_type, "application/json");
}

#[test]
fn test_no_ack_makes_queue_transient_and_auto_deleting() {
    let opts =
        QueueOptions::with_defaults("orders", &CallOptions::default(), &BusSettings::default());
    assert!(!opts.ack);
    assert!(!opts.durable);
    assert!(!opts.persistent);
    assert!(opts.auto_delete);
}

#[test]
fn test_acknowledge_alias_and_explicit_auto_delete() {
    let call = CallOptions {
        acknowledge: Some(true),
        auto_delete: Some(true),
        ..CallOptions::default()
    };
    let opts = QueueOptions::with_defaults("orders", &call, &BusSettings::default());
    assert!(opts.ack);
    assert!(opts.durable);
    assert!(opts.auto_delete);
}

#[test]
fn test_persistent_without_ack_keeps_queue_transient() {
    let call = CallOptions {
        persistent: Some(true),
        ..CallOptions::default()
    };
    let opts = QueueOptions::with_defaults("orders", &call, &BusSettings::default());
    assert!(opts.persistent);
    assert!(!opts.durable);
}

#[test]
fn test_target_prefers_routing_key() {
    let settings = BusSettings::default();
    let plain = QueueOptions::with_defaults("orders", &CallOptions::default(), &settings);
    assert_eq!(plain.target(), "orders");
    assert_eq!(plain.error_queue_name(), "orders.error");
    assert_eq!(plain.queue_kind, QueueKind::Queue);

    let routed = QueueOptions::with_defaults(
        "orders",
        &CallOptions::default().with_routing_key("orders.*"),
        &settings,
    );
    assert_eq!(routed.target(), "orders.*");
}

#[test]
fn test_properties_carry_headers_and_correlation_id() {
    let call = CallOptions::default()
        .with_correlation_id("test-value")
        .with_header("audit", json!("value"));
    let opts = QueueOptions::with_defaults("orders", &call, &BusSettings::default());
    let props = opts.properties();

    assert_eq!(props.correlation_id.as_deref(), Some("test-value"));
    assert_eq!(props.headers.get("audit"), Some(&json!("value")));
    assert_eq!(props.content_type.as_deref(), Some("application/json"));
}

#[test]
fn test_call_options_reject_unknown_fields() {
    let parsed: Result<CallOptions, _> =
        serde_json::from_value(json!({ "ack": true, "maxRetries": 5 }));
    let parsed = parsed.unwrap();
    assert!(parsed.wants_ack());
    assert_eq!(parsed.max_retries, Some(5));

    let rejected: Result<CallOptions, _> = serde_json::from_value(json!({ "durableish": true }));
    assert!(rejected.is_err());
}

#[test]
fn test_json_codec_decodes_what_it_encodes() {
    let codec = JsonCodec;
    let value = json!({ "my": "event", "n": 1 });
    let bytes = codec.serialize(&value).unwrap();
    assert_eq!(codec.deserialize(&bytes).unwrap(), value);
    assert!(codec.deserialize(b"not json").is_err());
}

#[test]
fn test_message_accessors_read_injected_fields() {
    let msg = Message::new(
        json!({ "cid": "c-1", "type": "orders", "retriesRemaining": 2 }),
        Default::default(),
        Default::default(),
    );
    assert_eq!(msg.cid().as_deref(), Some("c-1"));
    assert_eq!(msg.message_type().as_deref(), Some("orders"));
    assert_eq!(msg.retries_remaining(), Some(2));

    let numeric = Message::new(json!({ "cid": 1 }), Default::default(), Default::default());
    assert_eq!(numeric.cid().as_deref(), Some("1"));
}
