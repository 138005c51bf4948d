// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use rabbitmq_jobs::{
    backend::memory::MemoryBroker,
    connection::{self, Connection},
    AmqpConfig, BackendKind, FailureContext, HandlerError, HandlerRegistry, MessageHandler,
};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc;

pub const HANDLER: &str = "Sample";

/// Fails its first `fail_first` calls, then succeeds. Every `failed` call is
/// forwarded to the receiver returned by `new`.
pub struct RecordingHandler {
    fail_first: u32,
    calls: AtomicU32,
    payloads: Mutex<Vec<Value>>,
    failures: mpsc::UnboundedSender<FailureContext>,
}

impl RecordingHandler {
    pub fn new(fail_first: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<FailureContext>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let handler = RecordingHandler {
            fail_first,
            calls: AtomicU32::new(0),
            payloads: Mutex::new(vec![]),
            failures,
        };
        (Arc::new(handler), rx)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, payload: &Value) -> Result<bool, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());

        if call < self.fail_first {
            return Err(HandlerError::new("boom").with_code(7));
        }
        Ok(true)
    }

    async fn failed(&self, ctx: FailureContext) {
        let _ = self.failures.send(ctx);
    }
}

pub fn config(name: &str) -> AmqpConfig {
    AmqpConfig::new(name).backend(BackendKind::Memory)
}

pub fn registry(handler: Arc<RecordingHandler>) -> HandlerRegistry {
    HandlerRegistry::new().register(HANDLER, handler)
}

pub async fn connect(broker: &MemoryBroker, cfg: &AmqpConfig) -> Box<dyn Connection> {
    connection::connect_with(broker, cfg).await.unwrap()
}
