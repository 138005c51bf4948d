// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Publisher
//!
//! Sends an envelope addressed to a registered handler. The topology the send
//! needs is declared first, then the message is published as persistent to
//! the normal exchange, or to the delayed exchange when a delay is requested,
//! with the queue name as routing key.
//!
//! A publish is either confirmed by the broker (the default) or wrapped in a
//! transaction covering exactly that one message. OpenTelemetry context is
//! propagated in the message headers.

use crate::{
    config::AmqpConfig,
    connection::{self, Channel, Connection},
    envelope::{Codec, Envelope, JsonCodec},
    errors::{ConnectionError, SendError},
    handler::HandlerRegistry,
    otel,
    topology::{Mode, TopologyManager, TopologyNames, TopologyOptions},
};
use chrono::{DateTime, Utc};
use opentelemetry::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Queue used when a request does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Requested delay before a message becomes visible to consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delay {
    #[default]
    None,
    /// Offset from now; negative offsets mean no delay
    After(chrono::Duration),
    /// Point in time; past instants mean no delay
    At(DateTime<Utc>),
}

impl Delay {
    /// Delay of `secs` seconds from now.
    pub fn seconds(secs: i64) -> Delay {
        Delay::After(chrono::Duration::seconds(secs))
    }

    /// Delay in milliseconds relative to `now`, never negative.
    pub fn millis_at(&self, now: DateTime<Utc>) -> u64 {
        let millis = match self {
            Delay::None => 0,
            Delay::After(offset) => offset.num_milliseconds(),
            Delay::At(at) => (*at - now).num_milliseconds(),
        };

        millis.max(0) as u64
    }

    /// Delay in milliseconds relative to the current time.
    pub fn as_millis(&self) -> u64 {
        self.millis_at(Utc::now())
    }
}

/// One unit of work to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    /// Name the target handler is registered under
    pub handler: String,
    /// Arbitrary JSON handed to the handler; must not be empty
    pub payload: Value,
    /// Queue name, also used as routing key
    pub queue: String,
    pub delay: Delay,
    /// Publish inside a broker transaction instead of with a confirm
    pub transaction: bool,
}

impl SendRequest {
    /// Creates a request for the default queue, without delay.
    ///
    /// # Parameters
    /// * `handler` - Registered handler name
    /// * `payload` - Data for the handler
    ///
    /// # Returns
    /// A new request
    pub fn new(handler: &str, payload: Value) -> Self {
        SendRequest {
            handler: handler.to_owned(),
            payload,
            queue: DEFAULT_QUEUE.to_owned(),
            delay: Delay::None,
            transaction: false,
        }
    }

    /// Sets the target queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    /// Sets the delay before the message becomes visible.
    ///
    /// # Parameters
    /// * `delay` - Offset or instant; past values mean no delay
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delay(mut self, delay: Delay) -> Self {
        self.delay = delay;
        self
    }

    /// Wraps the publish in a broker transaction.
    pub fn transaction(mut self) -> Self {
        self.transaction = true;
        self
    }
}

/// Publishes jobs over one owned connection.
pub struct Publisher {
    connection: Box<dyn Connection>,
    registry: HandlerRegistry,
    codec: Arc<dyn Codec>,
}

impl Publisher {
    /// Creates a publisher owning `connection`.
    ///
    /// # Parameters
    /// * `connection` - Open broker connection
    /// * `registry` - Handlers a request may address
    ///
    /// # Returns
    /// A publisher encoding envelopes as JSON
    pub fn new(connection: Box<dyn Connection>, registry: HandlerRegistry) -> Self {
        Publisher {
            connection,
            registry,
            codec: Arc::new(JsonCodec),
        }
    }

    /// Opens a connection with the backend `cfg` selects.
    pub async fn connect(cfg: &AmqpConfig, registry: HandlerRegistry) -> Result<Self, SendError> {
        Ok(Publisher::new(connection::connect(cfg).await?, registry))
    }

    /// Replaces the envelope codec.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Validates, declares the topology and publishes one envelope.
    pub async fn send(&self, req: &SendRequest) -> Result<(), SendError> {
        self.validate(req)?;

        let delay_ms = req.delay.as_millis();
        let channel = self.connection.create_channel().await?;

        let result = self.publish(&channel, req, delay_ms).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close publisher channel");
        }

        match result {
            Ok(()) => {
                debug!(
                    handler = req.handler,
                    queue = req.queue,
                    delay_ms,
                    "message published"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
        }
    }

    /// Closes the underlying connection.
    pub async fn close(self) -> Result<(), ConnectionError> {
        self.connection.close().await
    }

    fn validate(&self, req: &SendRequest) -> Result<(), SendError> {
        if !self.registry.contains(&req.handler) {
            return Err(SendError::UnknownHandler(req.handler.clone()));
        }

        if is_empty_payload(&req.payload) {
            return Err(SendError::EmptyPayload);
        }

        if req.queue.trim().is_empty() {
            return Err(SendError::EmptyQueueName);
        }

        Ok(())
    }

    async fn publish(
        &self,
        channel: &Arc<dyn Channel>,
        req: &SendRequest,
        delay_ms: u64,
    ) -> Result<(), SendError> {
        let cfg = self.connection.config();
        let names = TopologyNames::new(&cfg.connection_name);
        let mode = if delay_ms > 0 {
            Mode::Delayed
        } else {
            Mode::Normal
        };

        TopologyManager::ensure(
            channel.clone(),
            &names,
            mode,
            &[req.queue.clone()],
            &TopologyOptions {
                queue_ttl: cfg.queue_ttl,
                delayed: false,
            },
        )
        .await?;

        let envelope = Envelope::new(&req.handler, req.payload.clone(), delay_ms);
        let body = envelope
            .encode(self.codec.as_ref())
            .map_err(|err| SendError::Encode(err.to_string()))?;
        let props =
            otel::with_trace_context(&Context::current(), envelope.properties(self.codec.as_ref()));

        let exchange = match mode {
            Mode::Delayed => names.delay_exchange(),
            _ => names.normal_exchange(),
        };

        if !req.transaction {
            channel
                .confirm_select()
                .await
                .map_err(SendError::Publish)?;

            return channel
                .basic_publish(&exchange, &req.queue, &body, props)
                .await
                .map_err(SendError::Publish);
        }

        channel
            .tx_select()
            .await
            .map_err(SendError::Transaction)?;

        let committed = match channel
            .basic_publish(&exchange, &req.queue, &body, props)
            .await
        {
            Ok(()) => channel.tx_commit().await,
            Err(err) => Err(err),
        };

        if let Err(err) = committed {
            if let Err(rollback) = channel.tx_rollback().await {
                warn!(error = rollback.to_string(), "failure to rollback transaction");
            }
            return Err(SendError::Transaction(err));
        }

        Ok(())
    }
}

/// `null`, empty strings, empty arrays and empty objects carry no work.
pub fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::memory::{MemoryBroker, TopologySnapshot},
        connection::{Backend, BackendKind, MockChannel, MockConnection},
        errors::AmqpError,
        handler::MockMessageHandler,
    };
    use chrono::TimeZone;
    use serde_json::json;

    async fn publisher(broker: &MemoryBroker) -> Publisher {
        let cfg = AmqpConfig::new("app").backend(BackendKind::Memory);
        let registry = HandlerRegistry::new().register("Sample", Arc::new(MockMessageHandler::new()));
        Publisher::new(broker.connect(&cfg).await.unwrap(), registry)
    }

    #[test]
    fn delay_normalises_to_non_negative_millis() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        assert_eq!(Delay::None.millis_at(now), 0);
        assert_eq!(Delay::seconds(3).millis_at(now), 3000);
        assert_eq!(Delay::seconds(-3).millis_at(now), 0);
        assert_eq!(
            Delay::At(now + chrono::Duration::milliseconds(1500)).millis_at(now),
            1500
        );
        assert_eq!(
            Delay::At(now - chrono::Duration::minutes(5)).millis_at(now),
            0
        );
    }

    #[test]
    fn empty_payloads() {
        assert!(is_empty_payload(&json!(null)));
        assert!(is_empty_payload(&json!("")));
        assert!(is_empty_payload(&json!([])));
        assert!(is_empty_payload(&json!({})));
        assert!(!is_empty_payload(&json!(0)));
        assert!(!is_empty_payload(&json!(false)));
        assert!(!is_empty_payload(&json!({"x": 1})));
    }

    #[tokio::test]
    async fn invalid_requests_fail_before_any_declaration() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker).await;

        assert_eq!(
            publisher
                .send(&SendRequest::new("Unknown", json!({"x": 1})))
                .await,
            Err(SendError::UnknownHandler("Unknown".to_owned()))
        );
        assert_eq!(
            publisher.send(&SendRequest::new("Sample", json!({}))).await,
            Err(SendError::EmptyPayload)
        );
        assert_eq!(
            publisher
                .send(&SendRequest::new("Sample", json!({"x": 1})).queue(""))
                .await,
            Err(SendError::EmptyQueueName)
        );

        assert_eq!(broker.topology_snapshot(), TopologySnapshot::default());
    }

    #[tokio::test]
    async fn delayed_send_goes_through_delay_exchange() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker).await;

        publisher
            .send(&SendRequest::new("Sample", json!({"x": 1})).delay(Delay::seconds(60)))
            .await
            .unwrap();

        let snapshot = broker.topology_snapshot();
        assert!(snapshot.exchanges.contains_key("app.delay"));
        assert_eq!(broker.queue_len("default"), Some(0));
    }

    /// Channel that accepts the topology of one immediate send.
    fn declaring_channel() -> MockChannel {
        let mut channel = MockChannel::new();
        channel.expect_exchange_declare().times(2).returning(|_| Ok(()));
        channel.expect_queue_declare().times(1).returning(|_| Ok(()));
        channel.expect_queue_bind().times(1).returning(|_| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));
        channel
    }

    fn mocked_publisher(channel: MockChannel) -> Publisher {
        let channel: Arc<dyn Channel> = Arc::new(channel);

        let mut conn = MockConnection::new();
        conn.expect_config().return_const(AmqpConfig::new("app"));
        conn.expect_create_channel()
            .times(1)
            .return_once(move || Ok(channel));

        let registry = HandlerRegistry::new().register("Sample", Arc::new(MockMessageHandler::new()));
        Publisher::new(Box::new(conn), registry)
    }

    #[tokio::test]
    async fn nacked_publish_is_a_publish_error() {
        let mut channel = declaring_channel();
        channel.expect_confirm_select().times(1).returning(|| Ok(()));
        channel
            .expect_basic_publish()
            .withf(|exchange, key, _, _| exchange.to_string() == "app" && key.to_string() == "jobs")
            .times(1)
            .returning(|_, _, _, _| Err(AmqpError::PublishNacked));
        channel.expect_tx_select().never();

        let publisher = mocked_publisher(channel);

        assert_eq!(
            publisher
                .send(&SendRequest::new("Sample", json!({"x": 1})).queue("jobs"))
                .await,
            Err(SendError::Publish(AmqpError::PublishNacked))
        );
    }

    #[tokio::test]
    async fn failed_publish_in_transaction_is_rolled_back() {
        let missing = AmqpError::PublishingError("NOT_FOUND - no exchange 'app'".to_owned());

        let mut channel = declaring_channel();
        channel.expect_confirm_select().never();
        channel.expect_tx_select().times(1).returning(|| Ok(()));
        let err = missing.clone();
        channel
            .expect_basic_publish()
            .times(1)
            .returning(move |_, _, _, _| Err(err.clone()));
        channel.expect_tx_commit().never();
        channel.expect_tx_rollback().times(1).returning(|| Ok(()));

        let publisher = mocked_publisher(channel);

        assert_eq!(
            publisher
                .send(&SendRequest::new("Sample", json!({"x": 1})).queue("jobs").transaction())
                .await,
            Err(SendError::Transaction(missing))
        );
    }

    #[tokio::test]
    async fn failed_commit_is_rolled_back() {
        let refused = AmqpError::TransactionError("commit refused".to_owned());

        let mut channel = declaring_channel();
        channel.expect_tx_select().times(1).returning(|| Ok(()));
        channel
            .expect_basic_publish()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let err = refused.clone();
        channel
            .expect_tx_commit()
            .times(1)
            .returning(move || Err(err.clone()));
        channel
            .expect_tx_rollback()
            .times(1)
            .returning(|| Err(AmqpError::ChannelClosed));

        let publisher = mocked_publisher(channel);

        assert_eq!(
            publisher
                .send(&SendRequest::new("Sample", json!({"x": 1})).queue("jobs").transaction())
                .await,
            Err(SendError::Transaction(refused))
        );
    }
}
