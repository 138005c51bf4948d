// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Dispatcher
//!
//! Runs the consume loop. The topology for the mode is ensured first, then
//! each queue gets its own channel, with prefetch and publisher confirms, and
//! its own tokio task handling one delivery at a time.
//!
//! The loop stops when every consumer stream ends, when shutdown is signalled
//! or when a queue hits a fatal broker error; the other queues are then told
//! to stop between deliveries. Channels are closed by their tasks, the
//! connection last.

use crate::{
    config::AmqpConfig,
    connection::{self, Channel, Connection, DeliveryStream},
    consumer::{consume, ConsumerContext, Disposition},
    envelope::{Codec, JsonCodec},
    errors::ConsumeError,
    handler::HandlerRegistry,
    otel::CONSUMER_TRACER,
    topology::{Mode, TopologyManager, TopologyNames, TopologyOptions},
};
use futures_util::{stream::FuturesUnordered, StreamExt};
use opentelemetry::global;
use std::{fmt, str::FromStr, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Default number of retries before a message is exhausted
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Topology a consumer declares before subscribing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumeMode {
    /// Main queues only. A failing message is exhausted on its first error
    /// unless another consumer declared its retry queue.
    #[default]
    Normal,
    /// Also declares the retry queues that bring failed messages back
    Retry,
}

impl fmt::Display for ConsumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumeMode::Normal => write!(f, "normal"),
            ConsumeMode::Retry => write!(f, "retry"),
        }
    }
}

impl FromStr for ConsumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(ConsumeMode::Normal),
            "retry" => Ok(ConsumeMode::Retry),
            other => Err(format!("invalid mode `{other}`, expected normal or retry")),
        }
    }
}

impl From<ConsumeMode> for Mode {
    fn from(mode: ConsumeMode) -> Mode {
        match mode {
            ConsumeMode::Normal => Mode::Normal,
            ConsumeMode::Retry => Mode::Retry,
        }
    }
}

/// What a dispatcher consumes and how it declares the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Queues to subscribe to, one channel each
    pub queues: Vec<String>,
    pub mode: ConsumeMode,
    /// Also declare the delayed exchange
    pub delay: bool,
    /// Retries allowed before a message is exhausted
    pub max_tries: u32,
    /// Retry queue TTL in milliseconds; the connection's when unset
    pub queue_ttl: Option<u32>,
    /// Prefetch per queue; the connection's when unset
    pub prefetch: Option<u16>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            queues: vec![],
            mode: ConsumeMode::Normal,
            delay: false,
            max_tries: DEFAULT_MAX_TRIES,
            queue_ttl: None,
            prefetch: None,
        }
    }
}

impl ConsumerOptions {
    /// Creates options for `queues` in normal mode with the default tries.
    ///
    /// # Parameters
    /// * `queues` - Queue names to consume
    ///
    /// # Returns
    /// New consumer options
    pub fn new(queues: &[&str]) -> Self {
        ConsumerOptions {
            queues: queues.iter().map(|q| (*q).to_owned()).collect(),
            ..ConsumerOptions::default()
        }
    }

    /// Sets the consume mode.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn mode(mut self, mode: ConsumeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Also declares the delayed exchange.
    pub fn delay(mut self, delay: bool) -> Self {
        self.delay = delay;
        self
    }

    /// Sets how many retries a message gets before it is exhausted.
    ///
    /// # Parameters
    /// * `max_tries` - Retry budget; 0 exhausts on the first error
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Overrides the connection's retry queue TTL.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_ttl(mut self, ttl: u32) -> Self {
        self.queue_ttl = Some(ttl);
        self
    }

    /// Overrides the connection's prefetch.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}

/// Consume loop over one owned connection.
pub struct Dispatcher {
    connection: Box<dyn Connection>,
    registry: HandlerRegistry,
    options: ConsumerOptions,
    codec: Arc<dyn Codec>,
}

impl Dispatcher {
    /// Creates a dispatcher owning `connection`.
    ///
    /// # Parameters
    /// * `connection` - Open broker connection, closed when the loop ends
    /// * `registry` - Handlers deliveries are dispatched to
    /// * `options` - Queues, mode and retry settings
    ///
    /// # Returns
    /// A dispatcher decoding envelopes as JSON
    pub fn new(
        connection: Box<dyn Connection>,
        registry: HandlerRegistry,
        options: ConsumerOptions,
    ) -> Self {
        Dispatcher {
            connection,
            registry,
            options,
            codec: Arc::new(JsonCodec),
        }
    }

    /// Opens a connection with the backend `cfg` selects.
    pub async fn connect(
        cfg: &AmqpConfig,
        registry: HandlerRegistry,
        options: ConsumerOptions,
    ) -> Result<Self, ConsumeError> {
        Ok(Dispatcher::new(
            connection::connect(cfg).await?,
            registry,
            options,
        ))
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Consumes until every consumer stream ends or a fatal error occurs.
    pub async fn run(self) -> Result<(), ConsumeError> {
        let (_, shutdown) = watch::channel(false);
        self.run_until(shutdown).await
    }

    /// Consumes until `shutdown` turns true, every consumer stream ends or a
    /// fatal error occurs. Dropping the sender does not stop the loop.
    pub async fn run_until(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumeError> {
        if self.options.queues.is_empty() {
            return Err(ConsumeError::NoQueues);
        }

        let cfg = self.connection.config().clone();
        let names = TopologyNames::new(&cfg.connection_name);

        if let Err(err) = self.setup(&cfg, &names).await {
            error!(error = err.to_string(), "failure to declare the topology");
            self.close_connection().await;
            return Err(err);
        }

        let subscriptions = match self.subscribe_all(&cfg).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                self.close_connection().await;
                return Err(err);
            }
        };

        let (stop_tx, _) = watch::channel(false);
        let mut tasks: FuturesUnordered<JoinHandle<Result<(), ConsumeError>>> =
            FuturesUnordered::new();

        for (queue, channel, deliveries) in subscriptions {
            let ctx = ConsumerContext {
                connection_name: cfg.connection_name.clone(),
                queue,
                names: names.clone(),
                max_tries: self.options.max_tries,
                registry: self.registry.clone(),
                codec: self.codec.clone(),
            };

            tasks.push(tokio::spawn(consume_queue(
                ctx,
                channel,
                deliveries,
                stop_tx.subscribe(),
            )));
        }

        info!(
            queues = ?self.options.queues,
            mode = %self.options.mode,
            "waiting for messages"
        );

        let mut first_error = None;
        let mut stopping = false;

        loop {
            tokio::select! {
                _ = signalled(&mut shutdown), if !stopping => {
                    info!("shutdown requested, stopping consumers");
                    stopping = true;
                    stop_tx.send_replace(true);
                }

                finished = tasks.next() => {
                    let Some(joined) = finished else {
                        break;
                    };

                    let result = joined.map_err(|err| ConsumeError::Join(err.to_string()))
                        .and_then(|r| r);

                    if let Err(err) = result {
                        error!(error = err.to_string(), "consumer stopped on error");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        stopping = true;
                        stop_tx.send_replace(true);
                    }
                }
            }
        }

        let closed = self.connection.close().await;
        debug!("amqp connection closed");

        match (first_error, closed) {
            (Some(err), _) => Err(err),
            (None, Err(err)) => Err(err.into()),
            (None, Ok(())) => Ok(()),
        }
    }

    async fn setup(&self, cfg: &AmqpConfig, names: &TopologyNames) -> Result<(), ConsumeError> {
        let channel = self.connection.create_channel().await?;

        let result = TopologyManager::ensure(
            channel.clone(),
            names,
            self.options.mode.into(),
            &self.options.queues,
            &TopologyOptions {
                queue_ttl: self.options.queue_ttl.unwrap_or(cfg.queue_ttl),
                delayed: self.options.delay,
            },
        )
        .await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close setup channel");
        }

        Ok(result?)
    }

    async fn subscribe_all(
        &self,
        cfg: &AmqpConfig,
    ) -> Result<Vec<(String, Arc<dyn Channel>, DeliveryStream)>, ConsumeError> {
        let prefetch = self.options.prefetch.unwrap_or(cfg.prefetch);
        let mut subscriptions = vec![];

        for queue in &self.options.queues {
            let channel = self.connection.create_channel().await?;

            match subscribe(&channel, queue, prefetch, &cfg.connection_name).await {
                Ok(deliveries) => subscriptions.push((queue.clone(), channel, deliveries)),
                Err(err) => {
                    error!(error = err.to_string(), queue, "error to create the consumer");
                    close_channel(&channel).await;
                    for (_, opened, _) in subscriptions {
                        close_channel(&opened).await;
                    }
                    return Err(err);
                }
            }
        }

        Ok(subscriptions)
    }

    async fn close_connection(&self) {
        if let Err(err) = self.connection.close().await {
            warn!(error = err.to_string(), "failure to close connection");
        }
    }
}

async fn subscribe(
    channel: &Arc<dyn Channel>,
    queue: &str,
    prefetch: u16,
    connection_name: &str,
) -> Result<DeliveryStream, ConsumeError> {
    channel
        .basic_qos(prefetch)
        .await
        .map_err(|err| ConsumeError::Consumer(queue.to_owned(), err))?;

    channel
        .confirm_select()
        .await
        .map_err(|err| ConsumeError::Consumer(queue.to_owned(), err))?;

    channel
        .basic_consume(queue, &format!("{connection_name}.{queue}"))
        .await
        .map_err(|err| ConsumeError::Consumer(queue.to_owned(), err))
}

/// Handles the deliveries of one queue until its stream ends, `stop` is
/// raised or a fatal error occurs. The channel is closed on the way out.
async fn consume_queue(
    ctx: ConsumerContext,
    channel: Arc<dyn Channel>,
    mut deliveries: DeliveryStream,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ConsumeError> {
    let tracer = global::tracer(CONSUMER_TRACER);

    let result = loop {
        tokio::select! {
            biased;

            _ = signalled(&mut stop) => break Ok(()),

            next = deliveries.next() => match next {
                None => {
                    debug!(queue = ctx.queue, "consumer stream ended");
                    break Ok(());
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue = ctx.queue, "errors consume msg");
                    break Err(ConsumeError::Consumer(ctx.queue.clone(), err));
                }
                Some(Ok(delivery)) => match consume(&tracer, &delivery, &ctx, &channel).await {
                    Ok(Disposition::Acked) => {}
                    Ok(disposition) => {
                        debug!(queue = ctx.queue, %disposition, "message settled");
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue = ctx.queue, "error consume msg");
                        break Err(err);
                    }
                },
            },
        }
    };

    close_channel(&channel).await;
    result
}

async fn close_channel(channel: &Arc<dyn Channel>) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), "failure to close channel");
    }
}

/// Resolves once the watched flag is true. Never resolves after the sender
/// is gone.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
