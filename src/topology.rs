// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares the broker objects the pub/sub layer relies on.
//!
//! The main components are:
//! - `bind`: opens a channel, declares one queue from a [`QueueSpec`] and binds
//!   it to its exchange. Used by every subscription.
//! - `Topology` trait / `AmqpTopology`: installs several exchanges and queues
//!   at once, typically at application start-up.
//! - Header constants for the queue arguments RabbitMQ understands.

use crate::{
    broker::{BrokerChannel, QueueHandle, Session},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueSpec,
};
use async_trait::async_trait;
use lapin::{options::ExchangeDeclareOptions, types::FieldTable};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Opens a channel, declares the queue described by `spec` and binds it to
/// its exchange under its routing key.
///
/// On failure the channel is closed before the error is returned, so nothing
/// opened by this call is left behind.
///
/// # Returns
/// The channel now owned by the caller and the declared queue
pub async fn bind(
    session: &dyn Session,
    spec: &QueueSpec,
) -> Result<(Arc<dyn BrokerChannel>, QueueHandle), AmqpError> {
    debug!("creating channel...");
    let channel = match session.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }?;

    match declare_and_bind(channel.as_ref(), spec).await {
        Ok(queue) => Ok((channel, queue)),
        Err(err) => {
            close_channel(channel.as_ref()).await;
            Err(err)
        }
    }
}

/// Closes a channel, logging instead of failing.
pub(crate) async fn close_channel(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), "failure to close channel");
    }
}

async fn declare_and_bind(
    channel: &dyn BrokerChannel,
    spec: &QueueSpec,
) -> Result<QueueHandle, AmqpError> {
    let queue = declare_queue(channel, spec).await?;
    bind_queue(channel, &queue.name, spec).await?;
    Ok(queue)
}

async fn declare_queue(
    channel: &dyn BrokerChannel,
    spec: &QueueSpec,
) -> Result<QueueHandle, AmqpError> {
    debug!("creating queue: {}", spec.name);

    match channel
        .queue_declare(&spec.name, spec.declare_options(), spec.arguments())
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = spec.name,
                "error to declare the queue"
            );
            Err(AmqpError::DeclareQueueError {
                name: spec.name.clone(),
                reason: err.to_string(),
            })
        }
        Ok(queue) => {
            debug!("queue: {} was created", queue.name);
            Ok(queue)
        }
    }
}

async fn bind_queue(
    channel: &dyn BrokerChannel,
    queue: &str,
    spec: &QueueSpec,
) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        queue, spec.exchange, spec.routing_key
    );

    match channel
        .queue_bind(queue, &spec.exchange, &spec.routing_key)
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(AmqpError::BindingExchangeToQueueError {
                exchange: spec.exchange.clone(),
                queue: queue.to_owned(),
                reason: err.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Declares one exchange on `channel`.
pub async fn declare_exchange(
    channel: &dyn BrokerChannel,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", def.name);

    match channel
        .exchange_declare(
            &def.name,
            (&def.kind).into(),
            ExchangeDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                auto_delete: def.delete,
                internal: def.internal,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError {
                name: def.name.clone(),
                reason: err.to_string(),
            })
        }
        _ => {
            debug!("exchange: {} was created", def.name);
            Ok(())
        }
    }
}

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue, together with its binding, to the topology.
    fn queue(self, spec: &'tp QueueSpec) -> Self;

    /// Declares every exchange, then every queue and its binding.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Installs a set of exchanges and queues over a single channel.
pub struct AmqpTopology<'tp> {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
    pub(crate) queues: Vec<&'tp QueueSpec>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, spec: &'tp QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            declare_exchange(self.channel.as_ref(), exch).await?;
        }

        for spec in &self.queues {
            declare_and_bind(self.channel.as_ref(), spec).await?;
        }

        debug!("topology installed");

        Ok(())
    }
}
