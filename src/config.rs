// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! `AmqpConfig` carries everything needed to open a broker connection and to
//! derive the topology names. It can be built by hand or loaded from `AMQP_*`
//! environment variables.

use crate::connection::BackendKind;
use std::{collections::BTreeMap, env, str::FromStr};
use thiserror::Error;

pub const ENV_CONNECTION_NAME: &str = "AMQP_CONNECTION_NAME";
pub const ENV_HOST: &str = "AMQP_HOST";
pub const ENV_PORT: &str = "AMQP_PORT";
pub const ENV_USER: &str = "AMQP_USER";
pub const ENV_PASSWORD: &str = "AMQP_PASSWORD";
pub const ENV_VHOST: &str = "AMQP_VHOST";
pub const ENV_LOCALE: &str = "AMQP_LOCALE";
pub const ENV_QUEUE_TTL: &str = "AMQP_QUEUE_TTL";
pub const ENV_PREFETCH: &str = "AMQP_PREFETCH";
pub const ENV_BACKEND: &str = "AMQP_BACKEND";
pub const ENV_CONNECT_OPTIONS: &str = "AMQP_CONNECT_OPTIONS";

/// Configuration error type
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but its value does not parse
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    /// Reads the configuration, falling back to defaults for unset variables.
    fn from_env() -> Result<Self, ConfigError>;
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpConfig {
    /// Logical connection name; also the base name of every exchange
    pub connection_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Virtual host, `/` by default
    pub vhost: String,
    /// Locale announced when the connection opens
    pub locale: String,
    /// Message TTL of the retry queues, in milliseconds. 0 disables it.
    pub queue_ttl: u32,
    /// Deliveries in flight per consumer channel
    pub prefetch: u16,
    /// Backend specific options, validated at connect time
    pub connect_options: BTreeMap<String, String>,
    /// Client implementation `connection::connect` opens
    pub backend: BackendKind,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            connection_name: "default".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            locale: "en_US".to_owned(),
            queue_ttl: 5000,
            prefetch: 1,
            connect_options: BTreeMap::new(),
            backend: BackendKind::default(),
        }
    }
}

impl AmqpConfig {
    /// Creates a configuration with default settings and the given name.
    ///
    /// # Parameters
    /// * `connection_name` - Logical connection name, base of the topology names
    ///
    /// # Returns
    /// A configuration pointing at a local broker as `guest`
    pub fn new(connection_name: &str) -> Self {
        AmqpConfig {
            connection_name: connection_name.to_owned(),
            ..AmqpConfig::default()
        }
    }

    /// Sets the broker address.
    ///
    /// # Parameters
    /// * `host` - Broker host name or address
    /// * `port` - Broker port
    ///
    /// # Returns
    /// Self for method chaining
    pub fn host(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_owned();
        self.port = port;
        self
    }

    /// Sets the user and password used to authenticate.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_owned();
        self.password = password.to_owned();
        self
    }

    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    /// Sets the default retry queue TTL.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds a retried message waits; 0 disables it
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_ttl(mut self, ttl: u32) -> Self {
        self.queue_ttl = ttl;
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Adds a backend specific connect option. Keys the backend does not
    /// support fail the connect.
    ///
    /// # Parameters
    /// * `key` - Option name, such as `heartbeat`
    /// * `value` - Option value as text
    ///
    /// # Returns
    /// Self for method chaining
    pub fn connect_option(mut self, key: &str, value: &str) -> Self {
        self.connect_options
            .insert(key.to_owned(), value.to_owned());
        self
    }
}

impl FromEnv for AmqpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = AmqpConfig::default();

        Ok(AmqpConfig {
            connection_name: env_or_default(ENV_CONNECTION_NAME, &defaults.connection_name),
            host: env_or_default(ENV_HOST, &defaults.host),
            port: env_parse_or(ENV_PORT, defaults.port)?,
            user: env_or_default(ENV_USER, &defaults.user),
            password: env_or_default(ENV_PASSWORD, &defaults.password),
            vhost: env_or_default(ENV_VHOST, &defaults.vhost),
            locale: env_or_default(ENV_LOCALE, &defaults.locale),
            queue_ttl: env_parse_or(ENV_QUEUE_TTL, defaults.queue_ttl)?,
            prefetch: env_parse_or(ENV_PREFETCH, defaults.prefetch)?,
            connect_options: match env::var(ENV_CONNECT_OPTIONS) {
                Ok(raw) => parse_connect_options(&raw)?,
                Err(_) => defaults.connect_options,
            },
            backend: env_parse_or(ENV_BACKEND, defaults.backend)?,
        })
    }
}

/// Helper to load an environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::ParseError {
            key: key.to_owned(),
            details: err.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Parses `key=value` pairs separated by commas, e.g. `heartbeat=30,connection_timeout=5000`.
pub fn parse_connect_options(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut options = BTreeMap::new();

    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ConfigError::ParseError {
                key: ENV_CONNECT_OPTIONS.to_owned(),
                details: format!("expected key=value, got `{pair}`"),
            });
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::ParseError {
                key: ENV_CONNECT_OPTIONS.to_owned(),
                details: format!("empty option name in `{pair}`"),
            });
        }

        options.insert(key.to_owned(), value.trim().to_owned());
    }

    Ok(options)
}
