// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! An envelope is the unit carried by one AMQP message: the name of the
//! handler, its payload, and the control headers the retry path relies on.
//!
//! On the wire the body is produced by a `Codec` (JSON by default) from
//! `{"handler": ..., "data": ...}`, and the control values travel in the
//! message headers:
//! - `x-delay`: requested delay in milliseconds
//! - `x-attempts`: failed processing attempts so far
//! - `x-exception`: JSON encoded last handler error, or void

use crate::errors::HandlerError;
use chrono::{DateTime, TimeZone, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the delay in milliseconds
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// Header carrying the attempt counter
pub const AMQP_HEADERS_ATTEMPTS: &str = "x-attempts";
/// Header carrying the last handler error
pub const AMQP_HEADERS_EXCEPTION: &str = "x-exception";
/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode for messages written to disk
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failure to encode body: {0}")]
    Encode(String),

    #[error("failure to decode body: {0}")]
    Decode(String),
}

/// Message body shared by every codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub handler: String,
    pub data: Value,
}

/// Serialization format of the message body.
pub trait Codec: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn encode(&self, body: &MessageBody) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, data: &[u8]) -> Result<MessageBody, CodecError>;
}

/// UTF-8 JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, body: &MessageBody) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(body).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<MessageBody, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Control headers of an envelope.
///
/// Values are never mutated in place: a failure produces a new `Headers`
/// through `with_failure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    pub attempts: u32,
    pub last_exception: Option<String>,
    pub delay_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl Headers {
    pub fn new(delay_ms: u64) -> Self {
        Headers {
            attempts: 0,
            last_exception: None,
            delay_ms,
            created_at: Utc::now(),
        }
    }

    /// Copy of these headers after one more failed attempt.
    pub fn with_failure(&self, err: &HandlerError) -> Self {
        Headers {
            attempts: self.attempts.saturating_add(1),
            last_exception: Some(err.to_json()),
            delay_ms: self.delay_ms,
            created_at: self.created_at,
        }
    }

    pub fn to_field_table(&self) -> FieldTable {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        btree.insert(
            ShortString::from(AMQP_HEADERS_DELAY),
            AMQPValue::LongLongInt(LongLongInt::try_from(self.delay_ms).unwrap_or(i64::MAX)),
        );
        btree.insert(
            ShortString::from(AMQP_HEADERS_ATTEMPTS),
            AMQPValue::LongLongInt(LongLongInt::from(self.attempts)),
        );
        btree.insert(
            ShortString::from(AMQP_HEADERS_EXCEPTION),
            match &self.last_exception {
                Some(exception) => AMQPValue::LongString(LongString::from(exception.as_str())),
                None => AMQPValue::Void,
            },
        );

        FieldTable::from(btree)
    }

    /// Reads the control headers of a delivery. Missing values fall back to
    /// those of a fresh message.
    pub fn from_properties(props: &BasicProperties) -> Self {
        let headers = match props.headers() {
            Some(val) => val.to_owned(),
            None => FieldTable::default(),
        };
        let table = headers.inner();

        let attempts = table
            .get(AMQP_HEADERS_ATTEMPTS)
            .and_then(as_integer)
            .map(|v| v.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or_default();

        let delay_ms = table
            .get(AMQP_HEADERS_DELAY)
            .and_then(as_integer)
            .map(|v| v.max(0) as u64)
            .unwrap_or_default();

        let last_exception = match table.get(AMQP_HEADERS_EXCEPTION) {
            Some(AMQPValue::LongString(value)) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            Some(AMQPValue::ShortString(value)) => Some(value.as_str().to_owned()),
            _ => None,
        }
        .filter(|e| !e.is_empty());

        let created_at = props
            .timestamp()
            .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single())
            .unwrap_or_else(Utc::now);

        Headers {
            attempts,
            last_exception,
            delay_ms,
            created_at,
        }
    }
}

/// Integer header value, whatever width the broker handed back.
fn as_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(*v as i64),
        AMQPValue::ShortShortUInt(v) => Some(*v as i64),
        AMQPValue::ShortInt(v) => Some(*v as i64),
        AMQPValue::ShortUInt(v) => Some(*v as i64),
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

/// Handler name, payload and control headers of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub handler: String,
    pub payload: Value,
    pub headers: Headers,
}

impl Envelope {
    pub fn new(handler: &str, payload: Value, delay_ms: u64) -> Self {
        Envelope {
            handler: handler.to_owned(),
            payload,
            headers: Headers::new(delay_ms),
        }
    }

    /// Copy of this envelope carrying the failure, ready for the retry exchange.
    pub fn retried(&self, err: &HandlerError) -> Self {
        Envelope {
            handler: self.handler.clone(),
            payload: self.payload.clone(),
            headers: self.headers.with_failure(err),
        }
    }

    pub fn encode(&self, codec: &dyn Codec) -> Result<Vec<u8>, CodecError> {
        codec.encode(&MessageBody {
            handler: self.handler.clone(),
            data: self.payload.clone(),
        })
    }

    /// Message properties: persistent, typed with the handler name, stamped
    /// with the creation time and carrying the control headers.
    pub fn properties(&self, codec: &dyn Codec) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(ShortString::from(codec.content_type()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_timestamp(self.headers.created_at.timestamp().max(0) as u64)
            .with_type(ShortString::from(self.handler.as_str()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(self.headers.to_field_table())
    }

    pub fn decode(
        codec: &dyn Codec,
        data: &[u8],
        props: &BasicProperties,
    ) -> Result<Envelope, CodecError> {
        let body = codec.decode(data)?;

        Ok(Envelope {
            handler: body.handler,
            payload: body.data,
            headers: Headers::from_properties(props),
        })
    }
}
