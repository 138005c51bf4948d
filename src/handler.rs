// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler is the business code a message is addressed to. Handlers are
//! registered by name in a `HandlerRegistry`; the publisher refuses to send to
//! a name that is not registered and the consumer looks the name up on every
//! delivery.

use crate::{envelope::Headers, errors::HandlerError};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

/// Everything a handler gets when a message reaches a terminal failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureContext {
    /// Connection name the message was consumed on
    pub connection: String,
    pub queue: String,
    pub payload: Value,
    pub headers: Headers,
}

/// Capability set every handler provides.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one payload.
    ///
    /// `Ok(true)` acks the message. `Ok(false)` reports a handled failure,
    /// which is terminal. `Err` sends the message down the retry path.
    async fn handle(&self, payload: &Value) -> Result<bool, HandlerError>;

    /// Called once when the message is exhausted or the handler reported a
    /// handled failure.
    async fn failed(&self, ctx: FailureContext);
}

/// Handlers by name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn register(mut self, name: &str, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(name.to_owned(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registry_resolves_by_name() {
        let mut mock = MockMessageHandler::new();
        mock.expect_handle().returning(|_| Ok(true));

        let registry = HandlerRegistry::new().register("Sample", Arc::new(mock));

        assert!(registry.contains("Sample"));
        assert!(!registry.contains("Other"));
        assert!(registry.get("Other").is_none());

        let handler = registry.get("Sample").unwrap();
        assert_eq!(handler.handle(&json!({"x": 1})).await, Ok(true));
    }

    #[test]
    fn names_are_sorted() {
        let registry = HandlerRegistry::new()
            .register("b", Arc::new(MockMessageHandler::new()))
            .register("a", Arc::new(MockMessageHandler::new()));

        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
