// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Command line surface of the `rabbitmq-jobs` binary.

use crate::{
    config::AmqpConfig,
    dispatcher::{ConsumeMode, ConsumerOptions, Dispatcher, DEFAULT_MAX_TRIES},
    errors::{ConsumeError, HandlerError, SendError},
    handler::{FailureContext, HandlerRegistry, MessageHandler},
    publisher::{Delay, Publisher, SendRequest, DEFAULT_QUEUE},
};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Name the example handler is registered under
pub const LOG_HANDLER: &str = "log";

#[derive(Parser, Debug)]
#[command(name = "rabbitmq-jobs")]
#[command(version)]
#[command(about = "Delayed and retried jobs on RabbitMQ")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume messages and run their handlers
    Receive(ReceiveArgs),

    /// Publish one message
    Send(SendArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Normal,
    Retry,
}

impl From<ModeArg> for ConsumeMode {
    fn from(mode: ModeArg) -> ConsumeMode {
        match mode {
            ModeArg::Normal => ConsumeMode::Normal,
            ModeArg::Retry => ConsumeMode::Retry,
        }
    }
}

#[derive(Args, Debug)]
pub struct ReceiveArgs {
    /// Queues to consume, comma separated
    #[arg(long, value_delimiter = ',', default_value = DEFAULT_QUEUE)]
    pub queues: Vec<String>,

    #[arg(long, value_enum, default_value_t = ModeArg::Normal)]
    pub mode: ModeArg,

    /// Retry queue TTL in seconds
    #[arg(long)]
    pub ttl: Option<u32>,

    /// Retries before a message is exhausted
    #[arg(long, default_value_t = DEFAULT_MAX_TRIES)]
    pub tries: u32,

    /// Also declare the delayed exchange
    #[arg(long)]
    pub delay: bool,
}

impl ReceiveArgs {
    pub fn consumer_options(&self) -> ConsumerOptions {
        let mut options = ConsumerOptions {
            queues: self.queues.clone(),
            ..ConsumerOptions::default()
        }
        .mode(self.mode.into())
        .max_tries(self.tries)
        .delay(self.delay);

        if let Some(ttl) = self.ttl {
            options = options.queue_ttl(ttl.saturating_mul(1000));
        }

        options
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// JSON payload
    pub data: String,

    #[arg(long, default_value = LOG_HANDLER)]
    pub handler: String,

    #[arg(long, default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Delay in seconds
    #[arg(long)]
    pub delay: Option<i64>,

    /// Publish inside a transaction
    #[arg(long)]
    pub transaction: bool,
}

impl SendArgs {
    pub fn request(&self) -> Result<SendRequest, CliError> {
        let payload: Value = serde_json::from_str(&self.data)
            .map_err(|err| CliError::InvalidPayload(err.to_string()))?;

        let mut req = SendRequest::new(&self.handler, payload).queue(&self.queue);
        if let Some(secs) = self.delay {
            req = req.delay(Delay::seconds(secs));
        }
        if self.transaction {
            req = req.transaction();
        }

        Ok(req)
    }
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),
}

/// Runs a parsed command until it completes or `shutdown` turns true.
pub async fn run(
    cli: Cli,
    cfg: AmqpConfig,
    registry: HandlerRegistry,
    shutdown: watch::Receiver<bool>,
) -> Result<(), CliError> {
    match cli.command {
        Commands::Receive(args) => {
            let dispatcher = Dispatcher::connect(&cfg, registry, args.consumer_options()).await?;
            dispatcher.run_until(shutdown).await?;
        }

        Commands::Send(args) => {
            let req = args.request()?;
            let publisher = Publisher::connect(&cfg, registry).await?;
            let sent = publisher.send(&req).await;
            if let Err(err) = publisher.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
            sent?;
        }
    }

    Ok(())
}

/// Example handler that logs what it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, payload: &Value) -> Result<bool, HandlerError> {
        info!(%payload, "handling message");
        Ok(true)
    }

    async fn failed(&self, ctx: FailureContext) {
        warn!(
            queue = ctx.queue,
            attempts = ctx.headers.attempts,
            exception = ctx.headers.last_exception.as_deref().unwrap_or_default(),
            "message failed"
        );
    }
}
