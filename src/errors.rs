// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Errors are split by the operation that raises them. `AmqpError` is what a
//! backend channel reports for a single broker call; the remaining enums are
//! what the public operations (connect, ensure, send, consume) return, each
//! one wrapping the broker reason that caused it.

use serde::Serialize;
use thiserror::Error;

/// Failure of a single broker operation, as reported by a backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The channel or its connection is no longer open
    #[error("channel closed")]
    ChannelClosed,

    /// Error declaring an exchange
    #[error("failure to declare exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue
    #[error("failure to declare queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error binding an exchange to another exchange
    #[error("failure to bind exchange `{0}` to exchange `{1}`: {2}")]
    BindingExchangeToExchangeError(String, String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively confirmed a publish
    #[error("publish was nacked by the broker")]
    PublishNacked,

    /// A mandatory publish matched no queue and was returned
    #[error("message to exchange `{0}` with key `{1}` is unroutable")]
    Unroutable(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error switching the channel into confirm mode
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// Error in a tx.select / tx.commit / tx.rollback round trip
    #[error("transaction failure: {0}")]
    TransactionError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`: {1}")]
    ConsumerDeclarationError(String, String),

    /// Error reported by a running consumer
    #[error("failure to consume message: {0}")]
    ConsumerError(String),

    /// Error closing the channel
    #[error("failure to close channel: {0}")]
    CloseError(String),
}

/// Errors raised while establishing or tearing down a broker connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The broker refused the connection or could not be reached
    #[error("failure to connect: {0}")]
    Connect(String),

    /// A connect option the selected backend does not understand
    #[error("unsupported connect option `{key}` for backend `{backend}`")]
    UnsupportedOption { backend: String, key: String },

    /// A connect option whose value the backend cannot parse
    #[error("invalid value `{value}` for connect option `{key}`")]
    InvalidOption { key: String, value: String },

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    Channel(String),

    /// Error closing the connection
    #[error("failure to close connection: {0}")]
    Close(String),
}

/// Errors raised while declaring exchanges, queues and bindings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// An empty queue list or an empty queue name
    #[error("invalid queue name `{0}`")]
    InvalidQueueName(String),

    /// The broker rejected a declaration or binding
    #[error(transparent)]
    Broker(#[from] AmqpError),

    /// The topology channel could not be opened
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Errors surfaced by `Publisher::send`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No handler with that name is registered
    #[error("handler `{0}` is not registered")]
    UnknownHandler(String),

    /// The payload is null or empty
    #[error("send data could not be empty")]
    EmptyPayload,

    /// The queue name is empty
    #[error("queue name could not be empty")]
    EmptyQueueName,

    /// The envelope could not be encoded
    #[error("failure to encode envelope: {0}")]
    Encode(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// The publish failed or was nacked
    #[error("failure to publish: {0}")]
    Publish(AmqpError),

    /// The publish transaction was rolled back
    #[error("transaction rolled back: {0}")]
    Transaction(AmqpError),
}

/// Errors that terminate a consume loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    /// No queue to subscribe to
    #[error("no queue to consume")]
    NoQueues,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// Error creating or running the broker consumer for a queue
    #[error("consumer failure on `{0}`: {1}")]
    Consumer(String, AmqpError),

    /// Error acknowledging a delivery
    #[error("failure to ack delivery: {0}")]
    Ack(AmqpError),

    /// Error negative-acknowledging a delivery
    #[error("failure to nack delivery: {0}")]
    Nack(AmqpError),

    /// Error republishing a failed message to the retry exchange
    #[error("failure to publish for retry: {0}")]
    RetryPublish(AmqpError),

    /// The retry envelope could not be encoded
    #[error("failure to encode retry envelope: {0}")]
    Encode(String),

    /// A consumer task panicked or was cancelled
    #[error("consumer task failure: {0}")]
    Join(String),
}

/// Error raised by a message handler.
///
/// Caught at the consumer boundary and turned into a retry or an exhaustion.
/// It is serialized into the `x-exception` header of the retried message.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub code: i64,
    pub trace: Vec<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
            code: 0,
            trace: vec![],
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }

    /// Builds a handler error from any error, keeping its source chain as the trace.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = vec![];
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }

        HandlerError {
            message: err.to_string(),
            code: 0,
            trace,
        }
    }

    /// JSON form stored in the `x-exception` header.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Error, Debug)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn handler_error_keeps_source_chain() {
        let err = HandlerError::from_error(&Outer(Inner));

        assert_eq!(err.message, "outer");
        assert_eq!(err.trace, vec!["inner".to_owned()]);
    }

    #[test]
    fn handler_error_json_has_message_code_and_trace() {
        let err = HandlerError::new("boom").with_code(42);
        let value: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();

        assert_eq!(value["message"], "boom");
        assert_eq!(value["code"], 42);
        assert!(value["trace"].as_array().unwrap().is_empty());
    }

    #[test]
    fn send_error_wraps_topology_reason() {
        let err: SendError = TopologyError::Broker(AmqpError::DeclareQueueError(
            "default".to_owned(),
            "PRECONDITION_FAILED".to_owned(),
        ))
        .into();

        assert!(err.to_string().contains("PRECONDITION_FAILED"));
    }
}
