// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Delayed and retried jobs on top of RabbitMQ.
//!
//! A `Publisher` sends an envelope addressed to a named handler, optionally
//! delayed. A `Dispatcher` consumes it, runs the handler from a
//! `HandlerRegistry` and drives the retry and exhaustion path through
//! dead-lettering.

mod otel;

pub mod backend;
pub mod cli;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;

pub use config::{AmqpConfig, FromEnv};
pub use connection::{connect, connect_with, BackendKind};
pub use dispatcher::{ConsumeMode, ConsumerOptions, Dispatcher};
pub use envelope::{Envelope, Headers};
pub use errors::HandlerError;
pub use handler::{FailureContext, HandlerRegistry, MessageHandler};
pub use publisher::{Delay, Publisher, SendRequest};
pub use retry::{Decision, RetryPolicy};
pub use topology::{Mode, TopologyManager, TopologyNames};
