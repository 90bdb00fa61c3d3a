// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Session Contract
//!
//! The rest of the crate talks to the broker only through the [`Session`] and
//! [`BrokerChannel`] traits defined here. `amqp` implements them on top of a
//! lapin connection and `memory` provides an in-process broker for tests.
//!
//! Sessions are passed explicitly to every operation; nothing in the crate
//! holds a global connection.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{DeliveryTag, FieldTable},
    BasicProperties, ExchangeKind,
};
use std::sync::Arc;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// A failure reported by the broker for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl BrokerError {
    pub fn new(reason: impl Into<String>) -> Self {
        BrokerError(reason.into())
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError(err.to_string())
    }
}

/// One broker-delivered message together with its acknowledgment handle.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    /// Queue name as reported by the broker (server-generated when the
    /// declaration used an empty name)
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Stream of deliveries for one consumer. Ends when the consumer is cancelled
/// or its channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Envelope, BrokerError>>;

/// A connected broker session able to open channels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Session: Send + Sync {
    /// Opens a new channel owned exclusively by the caller.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// The operations the pub/sub layer needs from a broker channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueHandle, BrokerError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Limits the number of unacknowledged deliveries held by consumers of
    /// this channel. Zero means unlimited.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Hands the message to the broker without waiting for a publisher
    /// confirmation.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: DeliveryTag, requeue: bool)
        -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
