// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Consumer
//!
//! Per-delivery state machine. A delivery is decoded into an envelope, checked
//! against the retry policy and handed to its handler. The outcome decides
//! what happens to the message:
//!
//! 1. exhausted on arrival: `failed` is called, then the message is acked
//! 2. handler returns `Ok(true)`: ack
//! 3. handler returns `Ok(false)`: `failed`, then ack
//! 4. handler returns `Err`: a copy with one more attempt and the recorded
//!    error is published to the retry exchange, then the original is nacked
//!    without requeue. When that copy would already be exhausted, or no retry
//!    queue is bound to take it, `failed` is called and the original acked
//!    instead.
//!
//! Undecodable messages and messages for unknown handlers are logged and acked.
//! Broker errors on ack, nack or the retry publish are returned to the caller.

use crate::{
    connection::{Channel, Delivery},
    envelope::{Codec, Envelope},
    errors::{AmqpError, ConsumeError},
    handler::{FailureContext, HandlerRegistry},
    otel,
    retry::{Decision, RetryPolicy},
    topology::TopologyNames,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, fmt, sync::Arc};
use tracing::{debug, error, warn};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled successfully and acked
    Acked,
    /// The handler reported a handled failure; `failed` called and acked
    Failed,
    /// Retry budget consumed; `failed` called and acked
    Exhausted,
    /// Republished to the retry exchange and the original nacked
    Retried,
    /// Undecodable or addressed to an unknown handler; acked
    Discarded,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Disposition::Acked => "acked",
            Disposition::Failed => "failed",
            Disposition::Exhausted => "exhausted",
            Disposition::Retried => "retried",
            Disposition::Discarded => "discarded",
        };
        write!(f, "{name}")
    }
}

/// What a consumer of one queue needs to process its deliveries.
pub struct ConsumerContext {
    /// Reported to handlers in `FailureContext::connection`
    pub connection_name: String,
    /// Queue the deliveries come from
    pub queue: String,
    /// Used to address the retry exchange and retry queue
    pub names: TopologyNames,
    /// Retries allowed before a message is exhausted
    pub max_tries: u32,
    pub registry: HandlerRegistry,
    /// Decodes envelopes and encodes retried copies
    pub codec: Arc<dyn Codec>,
}

/// Processes one delivery and settles it on `channel`.
pub async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    ctx: &ConsumerContext,
    channel: &Arc<dyn Channel>,
) -> Result<Disposition, ConsumeError> {
    let envelope = match Envelope::decode(ctx.codec.as_ref(), &delivery.data, &delivery.properties)
    {
        Ok(envelope) => envelope,
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = ctx.queue,
                "removing message from queue - reason: undecodable body"
            );
            ack(channel, delivery, None).await?;
            return Ok(Disposition::Discarded);
        }
    };

    let (_, mut span) = otel::new_span(&delivery.properties, tracer, &envelope.handler);

    debug!(
        "received: {} - exchange: {} - attempts: {}",
        envelope.handler, delivery.exchange, envelope.headers.attempts
    );

    let Some(handler) = ctx.registry.get(&envelope.handler) else {
        let msg = "removing message from queue - reason: unsupported handler";
        span.record_error(&AmqpError::ConsumerError(msg.to_owned()));
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });
        error!(handler = envelope.handler, queue = ctx.queue, "{}", msg);

        ack(channel, delivery, Some(&mut span)).await?;
        return Ok(Disposition::Discarded);
    };

    let decision = RetryPolicy::decide(
        envelope.headers.attempts,
        ctx.max_tries,
        envelope.headers.last_exception.is_some(),
    );

    if decision == Decision::Exhausted {
        warn!(
            handler = envelope.handler,
            attempts = envelope.headers.attempts,
            "too many attempts, message exhausted"
        );
        handler.failed(failure_context(ctx, &envelope)).await;
        span.set_status(Status::Error {
            description: Cow::from("message exhausted"),
        });

        ack(channel, delivery, Some(&mut span)).await?;
        return Ok(Disposition::Exhausted);
    }

    match handler.handle(&envelope.payload).await {
        Ok(true) => {
            debug!("message successfully processed");
            ack(channel, delivery, Some(&mut span)).await?;
            span.set_status(Status::Ok);
            Ok(Disposition::Acked)
        }

        Ok(false) => {
            warn!(handler = envelope.handler, "handler reported a failure");
            handler.failed(failure_context(ctx, &envelope)).await;
            span.set_status(Status::Error {
                description: Cow::from("handler reported a failure"),
            });

            ack(channel, delivery, Some(&mut span)).await?;
            Ok(Disposition::Failed)
        }

        Err(err) => {
            span.record_error(&err);
            let next = envelope.retried(&err);

            if RetryPolicy::decide(next.headers.attempts, ctx.max_tries, false)
                == Decision::Exhausted
            {
                error!(
                    error = err.to_string(),
                    attempts = next.headers.attempts,
                    "error whiling handling msg, no retry left"
                );
            } else {
                warn!(
                    error = err.to_string(),
                    attempts = next.headers.attempts,
                    "error whiling handling msg, sending to retry"
                );

                match retry(channel, ctx, &next).await {
                    Ok(()) => {
                        if let Err(e) = channel.basic_nack(delivery.delivery_tag, false).await {
                            error!("error whiling nack msg");
                            span.record_error(&e);
                            span.set_status(Status::Error {
                                description: Cow::from("error to nack msg"),
                            });
                            return Err(ConsumeError::Nack(e));
                        }

                        span.set_status(Status::Error {
                            description: Cow::from("msg was sent to retry"),
                        });
                        return Ok(Disposition::Retried);
                    }
                    // no retry queue is bound, so the copy would be dropped
                    Err(ConsumeError::RetryPublish(AmqpError::Unroutable(_, key))) => {
                        warn!(retry_key = key, "no retry queue bound, message exhausted");
                    }
                    Err(e) => {
                        error!(error = e.to_string(), "error whiling publishing for retry");
                        span.record_error(&e);
                        span.set_status(Status::Error {
                            description: Cow::from("error to publish msg for retry"),
                        });
                        return Err(e);
                    }
                }
            }

            handler.failed(failure_context(ctx, &next)).await;
            span.set_status(Status::Error {
                description: Cow::from("message exhausted"),
            });

            ack(channel, delivery, Some(&mut span)).await?;
            Ok(Disposition::Exhausted)
        }
    }
}

fn failure_context(ctx: &ConsumerContext, envelope: &Envelope) -> FailureContext {
    FailureContext {
        connection: ctx.connection_name.clone(),
        queue: ctx.queue.clone(),
        payload: envelope.payload.clone(),
        headers: envelope.headers.clone(),
    }
}

/// Publishes the retried copy to the retry exchange, confirmed by the broker.
/// The publish is mandatory, so a missing retry queue comes back as
/// `AmqpError::Unroutable` instead of silently dropping the copy.
async fn retry(
    channel: &Arc<dyn Channel>,
    ctx: &ConsumerContext,
    next: &Envelope,
) -> Result<(), ConsumeError> {
    let body = next
        .encode(ctx.codec.as_ref())
        .map_err(|err| ConsumeError::Encode(err.to_string()))?;
    let props = otel::with_trace_context(
        &opentelemetry::Context::current(),
        next.properties(ctx.codec.as_ref()),
    );

    channel
        .basic_publish_mandatory(
            &ctx.names.retry_exchange(),
            &ctx.names.retry_queue(&ctx.queue),
            &body,
            props,
        )
        .await
        .map_err(ConsumeError::RetryPublish)
}

async fn ack(
    channel: &Arc<dyn Channel>,
    delivery: &Delivery,
    span: Option<&mut BoxedSpan>,
) -> Result<(), ConsumeError> {
    match channel.basic_ack(delivery.delivery_tag).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("error whiling ack msg");
            if let Some(span) = span {
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
            }
            Err(ConsumeError::Ack(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::memory::MemoryBroker,
        config::AmqpConfig,
        connection::{Backend, BackendKind, Connection, DeliveryStream},
        envelope::{JsonCodec, AMQP_HEADERS_ATTEMPTS},
        errors::HandlerError,
        handler::{MessageHandler, MockMessageHandler},
        topology::{Mode, TopologyManager, TopologyOptions},
    };
    use futures_util::StreamExt;
    use lapin::types::AMQPValue;
    use opentelemetry::global;
    use serde_json::json;

    struct Fixture {
        broker: MemoryBroker,
        _conn: Box<dyn Connection>,
        channel: Arc<dyn Channel>,
        deliveries: DeliveryStream,
    }

    async fn fixture(envelope: &Envelope, mode: Mode) -> Fixture {
        let broker = MemoryBroker::new();
        let cfg = AmqpConfig::new("app").backend(BackendKind::Memory);
        let conn = broker.connect(&cfg).await.unwrap();
        let channel = conn.create_channel().await.unwrap();

        TopologyManager::ensure(
            channel.clone(),
            &TopologyNames::new("app"),
            mode,
            &["jobs".to_owned()],
            &TopologyOptions {
                queue_ttl: 5000,
                delayed: false,
            },
        )
        .await
        .unwrap();

        channel
            .basic_publish(
                "app",
                "jobs",
                &envelope.encode(&JsonCodec).unwrap(),
                envelope.properties(&JsonCodec),
            )
            .await
            .unwrap();

        let deliveries = channel.basic_consume("jobs", "test").await.unwrap();

        Fixture {
            broker,
            _conn: conn,
            channel,
            deliveries,
        }
    }

    fn context(handler: MockMessageHandler, max_tries: u32) -> ConsumerContext {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        ConsumerContext {
            connection_name: "app".to_owned(),
            queue: "jobs".to_owned(),
            names: TopologyNames::new("app"),
            max_tries,
            registry: HandlerRegistry::new().register("Sample", handler),
            codec: Arc::new(JsonCodec),
        }
    }

    async fn run(envelope: Envelope, handler: MockMessageHandler, max_tries: u32) -> (Fixture, Disposition) {
        run_in(Mode::Retry, envelope, handler, max_tries).await
    }

    async fn run_in(
        mode: Mode,
        envelope: Envelope,
        handler: MockMessageHandler,
        max_tries: u32,
    ) -> (Fixture, Disposition) {
        let mut fx = fixture(&envelope, mode).await;
        let delivery = fx.deliveries.next().await.unwrap().unwrap();

        let disposition = consume(
            &global::tracer("test"),
            &delivery,
            &context(handler, max_tries),
            &fx.channel,
        )
        .await
        .unwrap();

        (fx, disposition)
    }

    #[tokio::test]
    async fn success_is_acked() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .withf(|payload| payload.get("x") == Some(&json!(1)))
            .times(1)
            .returning(|_| Ok(true));
        handler.expect_failed().never();

        let (fx, disposition) =
            run(Envelope::new("Sample", json!({"x": 1}), 0), handler, 3).await;

        assert_eq!(disposition, Disposition::Acked);
        assert_eq!(fx.broker.queue_len("jobs"), Some(0));
        assert_eq!(fx.broker.queue_len("jobs.retry"), Some(0));
    }

    #[tokio::test]
    async fn handled_failure_is_terminal() {
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(1).returning(|_| Ok(false));
        handler
            .expect_failed()
            .withf(|ctx| ctx.queue == "jobs" && ctx.headers.attempts == 0)
            .times(1)
            .returning(|_| ());

        let (fx, disposition) =
            run(Envelope::new("Sample", json!({"x": 1}), 0), handler, 3).await;

        assert_eq!(disposition, Disposition::Failed);
        assert_eq!(fx.broker.queue_len("jobs.retry"), Some(0));
    }

    #[tokio::test]
    async fn handler_error_goes_to_retry_queue() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_| Err(HandlerError::new("boom")));
        handler.expect_failed().never();

        let (fx, disposition) =
            run(Envelope::new("Sample", json!({"x": 1}), 0), handler, 3).await;

        assert_eq!(disposition, Disposition::Retried);
        assert_eq!(fx.broker.queue_len("jobs"), Some(0));

        let retried = fx.broker.messages("jobs.retry");
        assert_eq!(retried.len(), 1);
        let headers = crate::envelope::Headers::from_properties(&retried[0].properties);
        assert_eq!(headers.attempts, 1);
        assert!(headers.last_exception.unwrap().contains("boom"));
        assert_eq!(
            retried[0]
                .properties
                .headers()
                .as_ref()
                .and_then(|h| h.inner().get(AMQP_HEADERS_ATTEMPTS).cloned()),
            Some(AMQPValue::LongLongInt(1))
        );
    }

    #[tokio::test]
    async fn first_failure_exhausts_without_tries() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_| Err(HandlerError::new("boom")));
        handler
            .expect_failed()
            .withf(|ctx| ctx.headers.attempts == 1 && ctx.headers.last_exception.is_some())
            .times(1)
            .returning(|_| ());

        let (fx, disposition) =
            run(Envelope::new("Sample", json!({"x": 1}), 0), handler, 0).await;

        assert_eq!(disposition, Disposition::Exhausted);
        assert_eq!(fx.broker.queue_len("jobs.retry"), Some(0));
    }

    #[tokio::test]
    async fn handler_error_without_retry_queue_is_exhausted() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_| Err(HandlerError::new("boom")));
        handler
            .expect_failed()
            .withf(|ctx| ctx.queue == "jobs" && ctx.headers.attempts == 1)
            .times(1)
            .returning(|_| ());

        let (fx, disposition) = run_in(
            Mode::Normal,
            Envelope::new("Sample", json!({"x": 1}), 0),
            handler,
            3,
        )
        .await;

        assert_eq!(disposition, Disposition::Exhausted);
        assert_eq!(fx.broker.queue_len("jobs"), Some(0));
        assert_eq!(fx.broker.queue_len("jobs.retry"), None);
        assert!(fx.channel.is_open());
    }

    #[tokio::test]
    async fn recorded_exception_exhausts_on_arrival() {
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().never();
        handler.expect_failed().times(1).returning(|_| ());

        let envelope =
            Envelope::new("Sample", json!({"x": 1}), 0).retried(&HandlerError::new("boom"));
        let (_fx, disposition) = run(envelope, handler, 3).await;

        assert_eq!(disposition, Disposition::Exhausted);
    }

    #[tokio::test]
    async fn unknown_handler_is_discarded() {
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().never();

        let (fx, disposition) = run(Envelope::new("Other", json!(1), 0), handler, 3).await;

        assert_eq!(disposition, Disposition::Discarded);
        assert_eq!(fx.broker.queue_len("jobs"), Some(0));
    }
}
