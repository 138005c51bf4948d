// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use chrono::Utc;
use common::{config, connect, registry, RecordingHandler, HANDLER};
use lapin::types::AMQPValue;
use rabbitmq_jobs::{
    backend::memory::MemoryBroker,
    connection::Backend,
    envelope::{JsonCodec, AMQP_HEADERS_DELAY, AMQP_HEADERS_EXCEPTION},
    errors::ConnectionError,
    topology::TopologyOptions,
    Delay, Envelope, Mode, Publisher, SendRequest, TopologyManager, TopologyNames,
};
use serde_json::json;
use std::time::Duration;

async fn publisher(broker: &MemoryBroker) -> Publisher {
    let (handler, _) = RecordingHandler::new(0);
    let cfg = config("app");
    Publisher::new(connect(broker, &cfg).await, registry(handler))
}

#[tokio::test]
async fn immediate_send_declares_one_bound_queue() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker).await;

    publisher
        .send(&SendRequest::new(HANDLER, json!({"x": 1})))
        .await
        .unwrap();

    let snapshot = broker.topology_snapshot();
    assert_eq!(
        snapshot.queues.keys().collect::<Vec<_>>(),
        vec!["default"]
    );
    assert_eq!(snapshot.queue_bindings.len(), 1);
    let binding = &snapshot.queue_bindings[0];
    assert_eq!(binding.queue(), "default");
    assert_eq!(binding.exchange_name(), "app");
    assert_eq!(binding.key(), "default");
    assert!(!snapshot.exchanges.contains_key("app.delay"));

    let messages = broker.messages("default");
    assert_eq!(messages.len(), 1);

    let msg = &messages[0];
    let envelope = Envelope::decode(&JsonCodec, &msg.data, &msg.properties).unwrap();
    assert_eq!(envelope.handler, HANDLER);
    assert_eq!(envelope.payload, json!({"x": 1}));
    assert_eq!(envelope.headers.attempts, 0);
    assert_eq!(envelope.headers.last_exception, None);

    let headers = msg.properties.headers().clone().unwrap();
    assert_eq!(
        headers.inner().get(AMQP_HEADERS_EXCEPTION),
        Some(&AMQPValue::Void)
    );
    assert_eq!(*msg.properties.delivery_mode(), Some(2));
    assert_eq!(
        msg.properties.kind().as_ref().map(|k| k.as_str()),
        Some(HANDLER)
    );
    assert!(msg.properties.message_id().is_some());
}

#[tokio::test]
async fn past_instant_is_sent_without_delay() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker).await;

    publisher
        .send(
            &SendRequest::new(HANDLER, json!({"x": 1}))
                .delay(Delay::At(Utc::now() - chrono::Duration::hours(1))),
        )
        .await
        .unwrap();

    assert!(!broker.topology_snapshot().exchanges.contains_key("app.delay"));

    let messages = broker.messages("default");
    assert_eq!(messages.len(), 1);
    let headers = messages[0].properties.headers().clone().unwrap();
    assert_eq!(
        headers.inner().get(AMQP_HEADERS_DELAY),
        Some(&AMQPValue::LongLongInt(0))
    );
}

#[tokio::test(start_paused = true)]
async fn delayed_send_arrives_after_the_delay() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker).await;

    publisher
        .send(&SendRequest::new(HANDLER, json!({"x": 1})).delay(Delay::seconds(2)))
        .await
        .unwrap();

    let snapshot = broker.topology_snapshot();
    let delay = &snapshot.exchange_bindings[0];
    assert_eq!(delay.source_name(), "app.delay");
    assert_eq!(delay.destination_name(), "app");
    assert_eq!(delay.key(), "#");

    assert_eq!(broker.queue_len("default"), Some(0));

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(broker.queue_len("default"), Some(1));
}

#[tokio::test]
async fn transactional_send_is_committed() {
    let broker = MemoryBroker::new();
    let publisher = publisher(&broker).await;

    publisher
        .send(
            &SendRequest::new(HANDLER, json!(["a", "b"]))
                .queue("orders")
                .transaction(),
        )
        .await
        .unwrap();

    assert_eq!(broker.queue_len("orders"), Some(1));
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn ensure_is_idempotent() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, &config("app")).await;
    let names = TopologyNames::new("app");
    let queues = vec!["jobs".to_owned(), "mails".to_owned()];
    let opts = TopologyOptions {
        queue_ttl: 5000,
        delayed: true,
    };

    let channel = conn.create_channel().await.unwrap();
    TopologyManager::ensure(channel.clone(), &names, Mode::Retry, &queues, &opts)
        .await
        .unwrap();
    let first = broker.topology_snapshot();

    TopologyManager::ensure(channel, &names, Mode::Retry, &queues, &opts)
        .await
        .unwrap();

    assert_eq!(broker.topology_snapshot(), first);
    assert_eq!(first.queues.len(), 4);
    assert_eq!(first.exchanges.len(), 3);
}

#[tokio::test]
async fn conflicting_ttl_is_reported() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, &config("app")).await;
    let names = TopologyNames::new("app");
    let queues = vec!["jobs".to_owned()];

    let channel = conn.create_channel().await.unwrap();
    TopologyManager::ensure(
        channel,
        &names,
        Mode::Retry,
        &queues,
        &TopologyOptions {
            queue_ttl: 5000,
            delayed: false,
        },
    )
    .await
    .unwrap();

    let channel = conn.create_channel().await.unwrap();
    let err = TopologyManager::ensure(
        channel,
        &names,
        Mode::Retry,
        &queues,
        &TopologyOptions {
            queue_ttl: 1000,
            delayed: false,
        },
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("jobs.retry"));
}

#[tokio::test]
async fn unsupported_connect_option_is_rejected() {
    let broker = MemoryBroker::new();
    let cfg = config("app").connect_option("heartbeat", "30");

    let err = broker.connect(&cfg).await.err().unwrap();
    assert_eq!(
        err,
        ConnectionError::UnsupportedOption {
            backend: "memory".to_owned(),
            key: "heartbeat".to_owned(),
        }
    );
}

#[tokio::test]
async fn wrong_credentials_are_refused() {
    let broker = MemoryBroker::new().with_credentials(&[("app", "secret")]);

    let err = broker.connect(&config("app")).await.err().unwrap();
    assert!(err.to_string().contains("ACCESS_REFUSED"));

    let cfg = config("app").credentials("app", "secret");
    assert!(broker.connect(&cfg).await.is_ok());
}
