// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pub/Sub Layer
//!
//! This module provides the error types for every messaging operation.
//! The `AmqpError` enum represents all the failure scenarios of connecting,
//! declaring topology, encoding and decoding payloads, publishing and
//! acknowledging messages. `ErrorKind` groups the variants into the coarse
//! categories callers usually branch on.

use thiserror::Error;

/// Coarse classification of an [`AmqpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Queue or exchange declaration/binding rejected by the broker
    Topology,
    /// The codec rejected a value
    Encode,
    /// A payload could not be turned back into a value
    Decode,
    /// A connect, send, consume or ack call was rejected by the broker
    Transport,
    /// A handler produced a decision outside the legal set
    ProtocolViolation,
    /// Runtime failures unrelated to the broker
    Internal,
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant carries the context needed to understand what failed
/// (names of the objects involved and the broker-reported reason).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{name}`: {reason}")]
    DeclareExchangeError { name: String, reason: String },

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{name}`: {reason}")]
    DeclareQueueError { name: String, reason: String },

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{exchange}` to queue `{queue}`: {reason}")]
    BindingExchangeToQueueError {
        exchange: String,
        queue: String,
        reason: String,
    },

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer for `{queue}`: {reason}")]
    BindingConsumerError { queue: String, reason: String },

    /// The codec could not serialize the value
    #[error("failure to encode payload: {0}")]
    EncodeError(String),

    /// The codec could not deserialize the payload
    #[error("failure to decode payload: {0}")]
    DecodeError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error requeuing a message
    #[error("failure to requeue message: {0}")]
    RequeuingMessageError(String),

    /// Error reported by the delivery stream
    #[error("failure to consume message: {0}")]
    ConsumerError(String),

    /// A raw acknowledgment decision outside the legal set
    #[error("unrecognized ack decision `{0}`")]
    ProtocolViolation(i64),
}

impl AmqpError {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::DeclareExchangeError { .. }
            | AmqpError::DeclareQueueError { .. }
            | AmqpError::BindingExchangeToQueueError { .. } => ErrorKind::Topology,
            AmqpError::EncodeError(_) => ErrorKind::Encode,
            AmqpError::DecodeError(_) => ErrorKind::Decode,
            AmqpError::ConnectionError(_)
            | AmqpError::ChannelError(_)
            | AmqpError::QoSDeclarationError(_)
            | AmqpError::BindingConsumerError { .. }
            | AmqpError::PublishingError(_)
            | AmqpError::AckMessageError(_)
            | AmqpError::NackMessageError(_)
            | AmqpError::RequeuingMessageError(_)
            | AmqpError::ConsumerError(_) => ErrorKind::Transport,
            AmqpError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            AmqpError::InternalError(_) => ErrorKind::Internal,
        }
    }
}
