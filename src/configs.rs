// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Configuration
//!
//! Connection parameters for the RabbitMQ server. Values can be built by hand
//! or loaded from the process environment (a `.env` file is honored).

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::env;
use tracing::warn;

pub const RABBITMQ_HOST_ENV_KEY: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_KEY: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_KEY: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_KEY: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST_ENV_KEY: &str = "RABBITMQ_VHOST";
pub const APP_NAME_ENV_KEY: &str = "APP_NAME";

/// Characters escaped in the user info and vhost of the URI: everything but
/// RFC 3986 unreserved characters
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Connection settings for a RabbitMQ server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Virtual host; empty selects the broker default.
    pub vhost: String,
    /// Name shown for the connection in the broker management UI
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            connection_name: "amqp-pubsub".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the configuration from environment variables, falling back to
    /// the defaults for any variable that is not set.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let default = RabbitMQConfigs::default();

        let port = match env::var(RABBITMQ_PORT_ENV_KEY) {
            Ok(raw) => raw.parse::<u16>().unwrap_or_else(|err| {
                warn!(
                    error = err.to_string(),
                    value = raw,
                    "invalid rabbitmq port, using default"
                );
                default.port
            }),
            Err(_) => default.port,
        };

        RabbitMQConfigs {
            host: env::var(RABBITMQ_HOST_ENV_KEY).unwrap_or(default.host),
            port,
            user: env::var(RABBITMQ_USER_ENV_KEY).unwrap_or(default.user),
            password: env::var(RABBITMQ_PASSWORD_ENV_KEY).unwrap_or(default.password),
            vhost: env::var(RABBITMQ_VHOST_ENV_KEY).unwrap_or(default.vhost),
            connection_name: env::var(APP_NAME_ENV_KEY).unwrap_or(default.connection_name),
        }
    }

    /// Renders the AMQP URI for these settings. User, password and vhost are
    /// percent-encoded, so `/` as vhost becomes `%2F`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            utf8_percent_encode(&self.user, URI_COMPONENT),
            utf8_percent_encode(&self.password, URI_COMPONENT),
            self.host,
            self.port,
            utf8_percent_encode(&self.vhost, URI_COMPONENT),
        )
    }
}
