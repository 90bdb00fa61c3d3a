// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Specifications
//!
//! A [`QueueSpec`] names a queue, the exchange and routing key it is bound
//! with, its durability and where rejected messages are dead-lettered.
//! Specs are immutable once built.

use crate::topology::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};

/// Lifetime policy of a queue.
///
/// - `Durable`: survives broker restarts and is shared between connections
/// - `Transient`: exclusive to the declaring connection and deleted when its
///   last consumer goes away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Durability {
    #[default]
    Durable,
    Transient,
}

/// Definition of a queue and its single binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub(crate) name: String,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) durability: Durability,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    /// Creates a durable queue spec bound to `exchange` under `routing_key`.
    ///
    /// An empty `name` lets the broker generate one.
    pub fn new(name: &str, exchange: &str, routing_key: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            durability: Durability::Durable,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn durable(self) -> Self {
        self.with_durability(Durability::Durable)
    }

    pub fn transient(self) -> Self {
        self.with_durability(Durability::Transient)
    }

    /// Redirects rejected and expired messages to `exchange`.
    pub fn with_dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Routing key used for dead-lettered messages. Without it the original
    /// routing key is kept.
    pub fn with_dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    /// Declaration flags derived from the durability.
    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        let durable = self.durability == Durability::Durable;

        QueueDeclareOptions {
            passive: false,
            durable,
            exclusive: !durable,
            auto_delete: !durable,
            nowait: false,
        }
    }

    /// Queue arguments carrying the dead-letter configuration.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }

        args
    }
}
