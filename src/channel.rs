// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Session Management
//!
//! This module establishes the connection to the RabbitMQ server. The
//! resulting [`AmqpSession`] is passed explicitly to the topology binder,
//! publishers and subscriptions, which open their own channels on it.

use crate::{broker::amqp::AmqpSession, configs::RabbitMQConfigs, errors::AmqpError};
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Connects to RabbitMQ using the connection details in `cfg`.
///
/// # Parameters
/// * `cfg` - RabbitMQ connection details: host, port, credentials, vhost and
///   the connection name shown in the management UI
///
/// # Returns
/// * `Result<AmqpSession, AmqpError>` - A session ready to create channels, or
///   `ConnectionError` when the broker cannot be reached
///
/// # Example
/// ```ignore
/// let session = new_amqp_session(&RabbitMQConfigs::from_env()).await?;
/// ```
pub async fn new_amqp_session(cfg: &RabbitMQConfigs) -> Result<AmqpSession, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(
                error = err.to_string(),
                host = cfg.host,
                port = cfg.port,
                "failure to connect"
            );
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    Ok(AmqpSession::new(Arc::new(conn)))
}
