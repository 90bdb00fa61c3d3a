// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! lapin-backed implementation of the broker session contract.

use super::{BrokerChannel, BrokerError, DeliveryStream, Envelope, QueueHandle, Session};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{DeliveryTag, FieldTable},
    BasicProperties, Channel, Connection, ExchangeKind,
};
use std::sync::Arc;
use tracing::debug;

/// AMQP reply code sent when closing a channel normally
const REPLY_SUCCESS: u16 = 200;

impl From<Delivery> for Envelope {
    fn from(delivery: Delivery) -> Self {
        Envelope {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// A [`Session`] over an established lapin connection.
#[derive(Clone)]
pub struct AmqpSession {
    conn: Arc<Connection>,
}

impl AmqpSession {
    pub fn new(conn: Arc<Connection>) -> AmqpSession {
        AmqpSession { conn }
    }

    /// Access the inner lapin connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.conn.create_channel().await?;
        debug!(id = channel.id(), "channel created");
        Ok(Arc::new(AmqpChannel { channel }))
    }
}

/// A [`BrokerChannel`] over a lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> AmqpChannel {
        AmqpChannel { channel }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(exchange, kind, options, arguments)
            .await?;
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueHandle, BrokerError> {
        let declared = self
            .channel
            .queue_declare(queue, options, arguments)
            .await?;

        Ok(QueueHandle {
            name: declared.name().as_str().to_owned(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
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
            .await?;

        Ok(consumer
            .map(|result| result.map(Envelope::from).map_err(BrokerError::from))
            .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        // the returned confirmation is dropped: publishing is fire-and-forget
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel.close(REPLY_SUCCESS, "closing channel").await?;
        Ok(())
    }
}
