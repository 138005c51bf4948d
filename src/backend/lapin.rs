// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Backend
//!
//! Connections and channels backed by the `lapin` AMQP 0-9-1 client.
//! Consumers are lapin streams mapped onto `Delivery`.

use crate::{
    config::AmqpConfig,
    connection::{Backend, BackendKind, Channel, Connection, Delivery, DeliveryStream},
    errors::{AmqpError, ConnectionError},
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, ConnectionProperties,
};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, error};

/// Connect options forwarded as URI query parameters
pub const LAPIN_CONNECT_OPTIONS: &[&str] =
    &["heartbeat", "connection_timeout", "channel_max", "frame_max"];

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBackend;

#[async_trait]
impl Backend for LapinBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lapin
    }

    fn supported_options(&self) -> &'static [&'static str] {
        LAPIN_CONNECT_OPTIONS
    }

    async fn open(&self, cfg: &AmqpConfig) -> Result<Box<dyn Connection>, ConnectionError> {
        let uri = amqp_uri(cfg)?;

        let mut options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));
        options.locale = cfg.locale.clone();

        match lapin::Connection::connect_uri(uri, options).await {
            Ok(conn) => Ok(Box::new(LapinConnection {
                cfg: cfg.clone(),
                conn,
            })),
            Err(err) => {
                error!(error = err.to_string(), host = cfg.host, "failure to connect");
                Err(ConnectionError::Connect(err.to_string()))
            }
        }
    }
}

/// Builds the typed connection URI. Connect options become its query
/// string and must parse as the integer type AMQP gives them.
pub fn amqp_uri(cfg: &AmqpConfig) -> Result<AMQPUri, ConnectionError> {
    let mut query = AMQPQueryString::default();
    for (key, value) in &cfg.connect_options {
        match key.as_str() {
            "heartbeat" => query.heartbeat = Some(option_value(key, value)?),
            "connection_timeout" => query.connection_timeout = Some(option_value(key, value)?),
            "channel_max" => query.channel_max = Some(option_value(key, value)?),
            "frame_max" => query.frame_max = Some(option_value(key, value)?),
            _ => {
                return Err(ConnectionError::UnsupportedOption {
                    backend: BackendKind::Lapin.to_string(),
                    key: key.clone(),
                })
            }
        }
    }

    Ok(AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: cfg.user.clone(),
                password: cfg.password.clone(),
            },
            host: cfg.host.clone(),
            port: cfg.port,
        },
        vhost: cfg.vhost.clone(),
        query,
    })
}

fn option_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConnectionError> {
    value.parse().map_err(|_| ConnectionError::InvalidOption {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

pub struct LapinConnection {
    cfg: AmqpConfig,
    conn: lapin::Connection,
}

#[async_trait]
impl Connection for LapinConnection {
    fn config(&self) -> &AmqpConfig {
        &self.cfg
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, ConnectionError> {
        debug!("creating amqp channel...");

        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(ConnectionError::Channel(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| ConnectionError::Close(err.to_string()))
    }
}

pub struct LapinChannel {
    channel: lapin::Channel,
}

impl LapinChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => Err(AmqpError::PublishNacked),
            // the broker acks a returned message after sending basic.return
            Ok(Confirmation::Ack(Some(returned))) => {
                debug!(
                    exchange,
                    routing_key,
                    reply = returned.reply_text.as_str(),
                    "mandatory publish returned"
                );
                Err(AmqpError::Unroutable(
                    exchange.to_owned(),
                    routing_key.to_owned(),
                ))
            }
            Ok(_) => Ok(()),
            Err(err) => Err(AmqpError::PublishingError(err.to_string())),
        }
    }
}

#[async_trait]
impl Channel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: def.is_passive(),
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: def.is_internal(),
                    nowait: def.is_no_wait(),
                },
                def.arguments(),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(def.name().to_owned(), err.to_string()))
    }

    async fn exchange_bind(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                binding.destination_name(),
                binding.source_name(),
                binding.key(),
                ExchangeBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToExchangeError(
                    binding.destination_name().to_owned(),
                    binding.source_name().to_owned(),
                    err.to_string(),
                )
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: def.is_passive(),
                    durable: def.is_durable(),
                    exclusive: def.is_exclusive(),
                    auto_delete: def.is_auto_delete(),
                    nowait: def.is_no_wait(),
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(def.name().to_owned(), err.to_string()))
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                binding.queue(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    binding.queue().to_owned(),
                    binding.exchange_name().to_owned(),
                    err.to_string(),
                )
            })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ConfirmSelectError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.publish(exchange, routing_key, body, properties, false)
            .await
    }

    async fn basic_publish_mandatory(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.publish(exchange, routing_key, body, properties, true)
            .await
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.channel
            .tx_select()
            .await
            .map_err(|err| AmqpError::TransactionError(err.to_string()))
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        self.channel
            .tx_commit()
            .await
            .map_err(|err| AmqpError::TransactionError(err.to_string()))
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        self.channel
            .tx_rollback()
            .await
            .map_err(|err| AmqpError::TransactionError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ConsumerDeclarationError(queue.to_owned(), err.to_string()))?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    redelivered: delivery.redelivered,
                    properties: delivery.properties,
                    data: delivery.data,
                }),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}
