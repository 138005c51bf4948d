// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{config, connect, registry, RecordingHandler, HANDLER};
use rabbitmq_jobs::{
    backend::memory::MemoryBroker, ConsumeMode, ConsumerOptions, Dispatcher, FailureContext,
    Publisher, SendRequest,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::timeout,
};

async fn send(broker: &MemoryBroker, handler: Arc<RecordingHandler>, queue: &str) {
    let publisher = Publisher::new(connect(broker, &config("app")).await, registry(handler));
    publisher
        .send(&SendRequest::new(HANDLER, json!({"x": 1})).queue(queue))
        .await
        .unwrap();
    publisher.close().await.unwrap();
}

async fn next_failure(rx: &mut mpsc::UnboundedReceiver<FailureContext>) -> FailureContext {
    timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("no failure reported in time")
        .expect("handler dropped")
}

#[tokio::test(start_paused = true)]
async fn failing_handler_is_retried_then_exhausted() {
    let broker = MemoryBroker::new();
    let (handler, mut failures) = RecordingHandler::new(u32::MAX);
    send(&broker, handler.clone(), "jobs").await;

    let options = ConsumerOptions::new(&["jobs"])
        .mode(ConsumeMode::Retry)
        .max_tries(1)
        .queue_ttl(5000);
    let dispatcher = Dispatcher::new(
        connect(&broker, &config("app")).await,
        registry(handler.clone()),
        options,
    );
    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(dispatcher.run_until(shutdown));

    let failure = next_failure(&mut failures).await;

    assert_eq!(handler.calls(), 1);
    assert_eq!(failure.connection, "app");
    assert_eq!(failure.queue, "jobs");
    assert_eq!(failure.payload, json!({"x": 1}));
    assert_eq!(failure.headers.attempts, 1);
    assert!(failure
        .headers
        .last_exception
        .as_deref()
        .is_some_and(|e| e.contains("boom")));

    stop.send_replace(true);
    running.await.unwrap().unwrap();

    assert_eq!(broker.queue_len("jobs"), Some(0));
    assert_eq!(broker.queue_len("jobs.retry"), Some(0));
    assert!(failures.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn normal_mode_failure_without_retry_queue_is_reported() {
    let broker = MemoryBroker::new();
    let (handler, mut failures) = RecordingHandler::new(u32::MAX);
    send(&broker, handler.clone(), "jobs").await;

    let dispatcher = Dispatcher::new(
        connect(&broker, &config("app")).await,
        registry(handler.clone()),
        ConsumerOptions::new(&["jobs"]).max_tries(3),
    );
    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(dispatcher.run_until(shutdown));

    let failure = next_failure(&mut failures).await;
    assert_eq!(failure.queue, "jobs");
    assert_eq!(failure.headers.attempts, 1);
    assert_eq!(handler.calls(), 1);

    stop.send_replace(true);
    running.await.unwrap().unwrap();

    let queues: Vec<_> = broker.topology_snapshot().queues.into_keys().collect();
    assert_eq!(queues, vec!["jobs".to_owned()]);
    assert_eq!(broker.queue_len("jobs"), Some(0));
    assert!(failures.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn zero_tries_fails_on_first_error() {
    let broker = MemoryBroker::new();
    let (handler, mut failures) = RecordingHandler::new(u32::MAX);
    send(&broker, handler.clone(), "jobs").await;

    let options = ConsumerOptions::new(&["jobs"])
        .mode(ConsumeMode::Retry)
        .max_tries(0);
    let dispatcher = Dispatcher::new(
        connect(&broker, &config("app")).await,
        registry(handler.clone()),
        options,
    );
    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(dispatcher.run_until(shutdown));

    let failure = next_failure(&mut failures).await;
    assert_eq!(failure.headers.attempts, 1);
    assert_eq!(handler.calls(), 1);
    assert_eq!(broker.queue_len("jobs.retry"), Some(0));

    stop.send_replace(true);
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn comeback_with_exception_is_exhausted_on_arrival() {
    let broker = MemoryBroker::new();
    let (handler, mut failures) = RecordingHandler::new(1);
    send(&broker, handler.clone(), "jobs").await;

    let options = ConsumerOptions::new(&["jobs"])
        .mode(ConsumeMode::Retry)
        .max_tries(3)
        .queue_ttl(1000);
    let dispatcher = Dispatcher::new(
        connect(&broker, &config("app")).await,
        registry(handler.clone()),
        options,
    );
    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(dispatcher.run_until(shutdown));

    let failure = next_failure(&mut failures).await;
    assert_eq!(failure.headers.attempts, 1);
    assert_eq!(handler.calls(), 1);

    stop.send_replace(true);
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn messages_of_every_queue_are_handled() {
    let broker = MemoryBroker::new();
    let (handler, _failures) = RecordingHandler::new(0);
    send(&broker, handler.clone(), "orders").await;
    send(&broker, handler.clone(), "mails").await;

    let dispatcher = Dispatcher::new(
        connect(&broker, &config("app")).await,
        registry(handler.clone()),
        ConsumerOptions::new(&["orders", "mails"]),
    );
    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(dispatcher.run_until(shutdown));

    timeout(Duration::from_secs(5), async {
        while handler.calls() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    stop.send_replace(true);
    running.await.unwrap().unwrap();

    assert_eq!(handler.payloads(), vec![json!({"x": 1}), json!({"x": 1})]);
    assert_eq!(broker.queue_len("orders"), Some(0));
    assert_eq!(broker.queue_len("mails"), Some(0));
}

#[tokio::test]
async fn broker_shutdown_ends_the_consume_loop() {
    let broker = MemoryBroker::new();
    let (handler, _failures) = RecordingHandler::new(0);

    let dispatcher = Dispatcher::new(
        connect(&broker, &config("app")).await,
        registry(handler),
        ConsumerOptions::new(&["jobs"]),
    );
    let running = tokio::spawn(dispatcher.run());

    while broker.queue_len("jobs").is_none() {
        tokio::task::yield_now().await;
    }
    broker.shutdown();

    timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
