// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connections and Channels
//!
//! This module defines the uniform connection and channel handles used by the
//! topology manager, the publisher and the consumer, and selects the backend
//! that implements them.
//!
//! Two backends exist:
//! - `lapin`: a real AMQP 0-9-1 client, with stream based consumers
//! - `memory`: an in-process broker with channel driven consumers, only built
//!   for tests or with the `test-support` feature
//!
//! `connect` picks the backend from `AmqpConfig::backend`. The in-process
//! broker has no address, so it is reached through `connect_with` and an
//! explicit `MemoryBroker` handle.

use crate::{
    backend::lapin::LapinBackend,
    config::AmqpConfig,
    errors::{AmqpError, ConnectionError},
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};
use tracing::{debug, error};

/// Available broker backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Lapin,
    #[cfg(any(test, feature = "test-support"))]
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Lapin => write!(f, "lapin"),
            #[cfg(any(test, feature = "test-support"))]
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lapin" | "amqp" => Ok(BackendKind::Lapin),
            #[cfg(any(test, feature = "test-support"))]
            "memory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

/// A message handed to a consumer, independent of the backend that produced it.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag to ack or nack the delivery with on its channel
    pub delivery_tag: u64,
    /// Exchange the message was last published to
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    /// Raw message body
    pub data: Vec<u8>,
}

/// Stream of deliveries for one consumer. It ends when the consumer is
/// cancelled or the connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Operations available on an open channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel number within its connection
    fn id(&self) -> u16;

    /// False once the channel or its connection is closed, broker side
    /// errors included.
    fn is_open(&self) -> bool;

    /// Limits the unacked deliveries in flight on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn exchange_bind(&self, binding: &ExchangeBinding) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Switches the channel into publisher confirm mode. Every later
    /// `basic_publish` waits for the broker's ack and fails on a nack.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Publishes with the mandatory flag on a channel in confirm mode. A
    /// message no queue is bound for is returned by the broker and reported
    /// as `AmqpError::Unroutable`.
    async fn basic_publish_mandatory(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn tx_select(&self) -> Result<(), AmqpError>;

    async fn tx_commit(&self) -> Result<(), AmqpError>;

    async fn tx_rollback(&self) -> Result<(), AmqpError>;

    /// Subscribes to `queue` with manual acks.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// The configuration the connection was opened with
    fn config(&self) -> &AmqpConfig;

    fn is_connected(&self) -> bool;

    /// Opens a new channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// A broker client implementation able to open connections.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which implementation this is, used in errors and logs
    fn kind(&self) -> BackendKind;

    /// Connect option keys this backend understands
    fn supported_options(&self) -> &'static [&'static str];

    /// Opens the connection without validating the options.
    async fn open(&self, cfg: &AmqpConfig) -> Result<Box<dyn Connection>, ConnectionError>;

    /// Validates the connect options, then opens the connection.
    async fn connect(&self, cfg: &AmqpConfig) -> Result<Box<dyn Connection>, ConnectionError> {
        validate_options(self.kind(), self.supported_options(), &cfg.connect_options)?;
        self.open(cfg).await
    }
}

/// Opens a connection with the backend selected by `cfg.backend`.
///
/// # Parameters
/// * `cfg` - Connection settings, the backend included
///
/// # Returns
/// The live connection, or `ConnectionError::Connect` when the backend cannot
/// be reached from a configuration alone.
pub async fn connect(cfg: &AmqpConfig) -> Result<Box<dyn Connection>, ConnectionError> {
    match cfg.backend {
        BackendKind::Lapin => connect_with(&LapinBackend, cfg).await,
        #[cfg(any(test, feature = "test-support"))]
        BackendKind::Memory => {
            error!("the memory backend needs an explicit broker handle");
            Err(ConnectionError::Connect(
                "the memory backend is reached through connect_with and a broker handle"
                    .to_owned(),
            ))
        }
    }
}

/// Opens a connection through an explicit backend.
///
/// # Parameters
/// * `backend` - Client implementation to connect with
/// * `cfg` - Connection settings; `cfg.backend` is not consulted
///
/// # Returns
/// The live connection. No partial connection is kept on failure.
pub async fn connect_with(
    backend: &dyn Backend,
    cfg: &AmqpConfig,
) -> Result<Box<dyn Connection>, ConnectionError> {
    debug!(backend = %backend.kind(), name = cfg.connection_name, "creating amqp connection...");

    match backend.connect(cfg).await {
        Ok(c) => {
            debug!("amqp connected");
            Ok(c)
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(err)
        }
    }
}

/// Rejects any connect option the backend does not list as supported.
pub fn validate_options(
    backend: BackendKind,
    supported: &[&str],
    options: &BTreeMap<String, String>,
) -> Result<(), ConnectionError> {
    for key in options.keys() {
        if !supported.contains(&key.as_str()) {
            return Err(ConnectionError::UnsupportedOption {
                backend: backend.to_string(),
                key: key.clone(),
            });
        }
    }

    Ok(())
}
