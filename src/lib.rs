// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Publish/subscribe over RabbitMQ: topology binding, payload codecs, a
//! fire-and-forget publisher and subscriptions that turn handler decisions
//! into acknowledgments.

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod codec;
pub mod configs;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod subscription;
pub mod topology;

pub use consumer::{
    AMQP_HEADERS_COUNT, AMQP_HEADERS_ORIGINAL_EXCHANGE, AMQP_HEADERS_ORIGINAL_ROUTING_KEY,
    AMQP_HEADERS_REDELIVERY_COUNT, AMQP_HEADERS_X_DEATH,
};
