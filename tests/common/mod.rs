// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use amqp_pubsub::{
    broker::{memory::MemorySession, Session},
    exchange::ExchangeDefinition,
    queue::QueueSpec,
    topology::{AmqpTopology, Topology},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DIRECT_EXCHANGE: &str = "peril_direct";
pub const TOPIC_EXCHANGE: &str = "peril_topic";
pub const DEAD_LETTER_EXCHANGE: &str = "peril_dlx";
pub const DEAD_LETTER_QUEUE: &str = "peril_dlq";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayingState {
    #[serde(rename = "IsPaused")]
    pub is_paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameLog {
    pub current_time: i64,
    pub message: String,
    pub username: String,
}

/// Declares the exchanges used across tests plus the dead-letter queue.
pub async fn install_topology(session: &MemorySession) {
    let direct = ExchangeDefinition::new(DIRECT_EXCHANGE).direct().durable();
    let topic = ExchangeDefinition::new(TOPIC_EXCHANGE).topic().durable();
    let dlx = ExchangeDefinition::new(DEAD_LETTER_EXCHANGE).fanout().durable();
    let dlq = QueueSpec::new(DEAD_LETTER_QUEUE, DEAD_LETTER_EXCHANGE, "");

    let channel = session.create_channel().await.unwrap();
    AmqpTopology::new(channel)
        .exchange(&direct)
        .exchange(&topic)
        .exchange(&dlx)
        .queue(&dlq)
        .install()
        .await
        .unwrap();
}

/// Polls `check` until it holds or two seconds went by.
pub async fn eventually<F>(check: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
