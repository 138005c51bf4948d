// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module derives and installs the exchange, queue and binding graph used
//! by publishers and consumers. For a connection named `app` and a queue `jobs`:
//!
//! - `app`: normal topic exchange; `jobs` is bound to it with key `jobs`
//! - `app.delay`: delayed exchange wrapping topic, bound into `app` with key `#`
//! - `app.retry`: retry topic exchange, dead-letter target of every main queue
//! - `jobs.retry`: retry queue bound to `app.retry` with key `jobs.retry`; its
//!   messages expire after the queue TTL and are dead-lettered back into `app`
//!   with key `jobs`
//!
//! Every entity is durable and never deleted. Declaring twice is a no-op on
//! the broker; declaring with different arguments fails with the broker's own
//! error.

use crate::{
    connection::Channel,
    errors::TopologyError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{fmt, str::FromStr, sync::Arc};
use tracing::{debug, error};

/// Suffix of the delayed exchange name
pub const DELAY_SUFFIX: &str = "delay";
/// Suffix of the retry exchange and retry queue names
pub const RETRY_SUFFIX: &str = "retry";

/// Operating mode the topology is declared for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Normal exchange, retry exchange and main queues
    #[default]
    Normal,
    /// `Normal` plus the delayed exchange
    Delayed,
    /// `Normal` plus the retry queues
    Retry,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal => write!(f, "normal"),
            Mode::Delayed => write!(f, "delayed"),
            Mode::Retry => write!(f, "retry"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "delayed" | "delay" => Ok(Mode::Delayed),
            "retry" => Ok(Mode::Retry),
            other => Err(format!("invalid mode `{other}`")),
        }
    }
}

/// Names derived from the connection name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNames {
    base: String,
}

impl TopologyNames {
    pub fn new(connection_name: &str) -> Self {
        TopologyNames {
            base: connection_name.to_owned(),
        }
    }

    pub fn normal_exchange(&self) -> String {
        self.base.clone()
    }

    pub fn delay_exchange(&self) -> String {
        format!("{}.{}", self.base, DELAY_SUFFIX)
    }

    pub fn retry_exchange(&self) -> String {
        format!("{}.{}", self.base, RETRY_SUFFIX)
    }

    pub fn retry_queue(&self, queue: &str) -> String {
        format!("{queue}.{RETRY_SUFFIX}")
    }
}

/// Settings that shape queue declarations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopologyOptions {
    /// Message TTL of the retry queues in milliseconds; 0 means no TTL
    pub queue_ttl: u32,
    /// Also declare the delayed exchange, whatever the mode
    pub delayed: bool,
}

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds an exchange-to-exchange binding to the topology.
    fn exchange_binding(self, binding: ExchangeBinding) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), TopologyError>;
}

/// Topology builder bound to one channel.
pub struct AmqpTopology {
    channel: Arc<dyn Channel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) exchanges_binding: Vec<ExchangeBinding>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn Channel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
            exchanges_binding: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        if !self.queues.iter().any(|q| q.name == def.name) {
            self.queues.push(def);
        }
        self
    }

    fn exchange_binding(mut self, binding: ExchangeBinding) -> Self {
        self.exchanges_binding.push(binding);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology in dependency order:
    /// 1. exchanges
    /// 2. queues
    /// 3. exchange-to-exchange bindings
    /// 4. queue-to-exchange bindings
    async fn install(&self) -> Result<(), TopologyError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_exchanges().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), TopologyError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = self.channel.exchange_declare(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                );
                return Err(err.into());
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), TopologyError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = self.channel.queue_declare(def).await {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                return Err(err.into());
            }

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_exchanges(&self) -> Result<(), TopologyError> {
        for binding in &self.exchanges_binding {
            debug!(
                "binding exchange: {} to the exchange: {} with the key: {}",
                binding.destination, binding.source, binding.routing_key
            );

            if let Err(err) = self.channel.exchange_bind(binding).await {
                error!(
                    error = err.to_string(),
                    "error to bind exchange to exchange"
                );
                return Err(err.into());
            }
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), TopologyError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = self.channel.queue_bind(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err.into());
            }
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// Declares the graph a given mode needs.
pub struct TopologyManager;

impl TopologyManager {
    /// Builds the topology for `mode` and `queues` without touching the broker.
    pub fn plan(
        channel: Arc<dyn Channel>,
        names: &TopologyNames,
        mode: Mode,
        queues: &[String],
        opts: &TopologyOptions,
    ) -> Result<AmqpTopology, TopologyError> {
        if queues.is_empty() {
            return Err(TopologyError::InvalidQueueName(String::new()));
        }
        if let Some(empty) = queues.iter().find(|q| q.trim().is_empty()) {
            return Err(TopologyError::InvalidQueueName(empty.clone()));
        }

        let normal = names.normal_exchange();
        let retry = names.retry_exchange();

        let mut topology = AmqpTopology::new(channel)
            .exchange(ExchangeDefinition::new(&normal).topic().durable())
            .exchange(ExchangeDefinition::new(&retry).topic().durable());

        if mode == Mode::Delayed || opts.delayed {
            let delay = names.delay_exchange();
            topology = topology
                .exchange(ExchangeDefinition::new(&delay).topic_delayed().durable())
                .exchange_binding(
                    ExchangeBinding::new(&normal)
                        .source(&delay)
                        .routing_key("#"),
                );
        }

        for queue in queues {
            topology = topology
                .queue(
                    QueueDefinition::new(queue)
                        .durable()
                        .dead_letter_exchange(&retry),
                )
                .queue_binding(
                    QueueBinding::new(queue)
                        .exchange(&normal)
                        .routing_key(queue),
                );

            if mode == Mode::Retry {
                let retry_queue = names.retry_queue(queue);
                let mut def = QueueDefinition::new(&retry_queue)
                    .durable()
                    .dead_letter_exchange(&normal)
                    .dead_letter_routing_key(queue);
                if opts.queue_ttl > 0 {
                    def = def.ttl(opts.queue_ttl);
                }

                topology = topology.queue(def).queue_binding(
                    QueueBinding::new(&retry_queue)
                        .exchange(&retry)
                        .routing_key(&retry_queue),
                );
            }
        }

        Ok(topology)
    }

    /// Declares every exchange, queue and binding `mode` needs for `queues`.
    pub async fn ensure(
        channel: Arc<dyn Channel>,
        names: &TopologyNames,
        mode: Mode,
        queues: &[String],
        opts: &TopologyOptions,
    ) -> Result<(), TopologyError> {
        debug!(mode = %mode, queues = ?queues, "ensuring topology");
        Self::plan(channel, names, mode, queues, opts)?
            .install()
            .await
    }
}
