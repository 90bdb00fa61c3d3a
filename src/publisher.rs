// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module encodes values with a [`Codec`] and publishes them to an
//! exchange under a routing key. Publishing is fire-and-forget: once the
//! message is handed to the channel the call returns, without waiting for a
//! broker confirmation, and nothing is retried. The current OpenTelemetry
//! context travels in the message headers.

use crate::{
    broker::{BrokerChannel, Session},
    codec::Codec,
    errors::AmqpError,
    otel,
    topology::close_channel,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes messages over a channel it owns.
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Returns
    /// An Arc-wrapped Publisher for sharing between tasks
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Arc<Publisher> {
        Arc::new(Publisher { channel })
    }

    /// Publishes `value` with the current trace context.
    pub async fn publish<T, C>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
        codec: &C,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
        C: Codec,
    {
        publish(self.channel.as_ref(), exchange, routing_key, value, codec).await
    }

    /// Publishes `value`, propagating `ctx` in the message headers.
    pub async fn publish_with_context<T, C>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        value: &T,
        codec: &C,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
        C: Codec,
    {
        publish_with_context(
            self.channel.as_ref(),
            ctx,
            exchange,
            routing_key,
            value,
            codec,
        )
        .await
    }
}

/// Encodes `value` with `codec` and sends it to `exchange` under
/// `routing_key`.
///
/// Fails with `EncodeError` before anything is sent when the codec rejects the
/// value, and with `PublishingError` when the channel rejects the send.
pub async fn publish<T, C>(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &C,
) -> Result<(), AmqpError>
where
    T: Serialize + ?Sized + Sync,
    C: Codec,
{
    let ctx = Context::current();
    publish_with_context(channel, &ctx, exchange, routing_key, value, codec).await
}

/// Same as [`publish`], propagating `ctx` instead of the current context.
///
/// # Parameters
/// * `channel` - Channel the message is sent on
/// * `ctx` - Trace context injected into the message headers
/// * `exchange` - Target exchange
/// * `routing_key` - Routing key used by the exchange
/// * `value` - Value to encode
/// * `codec` - Codec producing the payload and its content type
///
/// # Returns
/// * `Ok(())` once the channel accepted the message
/// * `Err(AmqpError::EncodeError)` when the value cannot be encoded
/// * `Err(AmqpError::PublishingError)` when the channel rejects the send
pub async fn publish_with_context<T, C>(
    channel: &dyn BrokerChannel,
    ctx: &Context,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &C,
) -> Result<(), AmqpError>
where
    T: Serialize + ?Sized + Sync,
    C: Codec,
{
    let payload = match codec.encode(value) {
        Ok(p) => Ok(p),
        Err(err) => {
            error!(error = err.to_string(), "error encoding message");
            Err(err)
        }
    }?;

    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject(ctx, &mut btree);

    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(codec.content_type()))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(btree));

    match channel
        .basic_publish(exchange, routing_key, &payload, properties)
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                exchange = exchange,
                key = routing_key,
                "error publishing message"
            );
            Err(AmqpError::PublishingError(err.to_string()))
        }
        _ => {
            debug!(exchange = exchange, key = routing_key, "message published");
            Ok(())
        }
    }
}

/// Opens a dedicated channel, publishes one message and closes the channel.
pub async fn publish_once<T, C>(
    session: &dyn Session,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &C,
) -> Result<(), AmqpError>
where
    T: Serialize + ?Sized + Sync,
    C: Codec,
{
    let channel = match session.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }?;

    let result = publish(channel.as_ref(), exchange, routing_key, value, codec).await;
    close_channel(channel.as_ref()).await;

    result
}
