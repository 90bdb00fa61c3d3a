// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use amqp_pubsub::{
    broker::{memory::InMemoryBroker, Session},
    errors::{AmqpError, ErrorKind},
    queue::QueueSpec,
    topology::{bind, AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
};
use common::*;
use lapin::types::{AMQPValue, LongString};

#[tokio::test]
async fn installs_exchanges_and_the_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    install_topology(&broker.connect()).await;

    assert!(broker.exchange_exists(DIRECT_EXCHANGE));
    assert!(broker.exchange_exists(TOPIC_EXCHANGE));
    assert!(broker.exchange_exists(DEAD_LETTER_EXCHANGE));
    assert!(broker.queue_exists(DEAD_LETTER_QUEUE));
}

#[tokio::test]
async fn bound_queue_carries_dead_letter_arguments() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let spec = QueueSpec::new("army_moves.alice", TOPIC_EXCHANGE, "army_moves.*")
        .with_dead_letter_exchange(DEAD_LETTER_EXCHANGE)
        .with_dead_letter_routing_key("failed");
    let (channel, queue) = bind(&session, &spec).await.unwrap();
    assert_eq!(queue.name, "army_moves.alice");

    let args = broker.queue_arguments("army_moves.alice").unwrap();
    assert_eq!(
        args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        Some(&AMQPValue::LongString(LongString::from(DEAD_LETTER_EXCHANGE)))
    );
    assert_eq!(
        args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        Some(&AMQPValue::LongString(LongString::from("failed")))
    );

    channel.close().await.unwrap();
}

#[tokio::test]
async fn rebinding_with_other_durability_is_rejected() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let durable = QueueSpec::new("pause.alice", DIRECT_EXCHANGE, "pause");
    let (channel, _) = bind(&session, &durable).await.unwrap();
    channel.close().await.unwrap();

    let err = bind(&session, &durable.clone().transient())
        .await
        .err()
        .unwrap();

    assert_eq!(err.kind(), ErrorKind::Topology);
    assert!(matches!(err, AmqpError::DeclareQueueError { name, .. } if name == "pause.alice"));
}

#[tokio::test]
async fn transient_queue_belongs_to_its_session() {
    let broker = InMemoryBroker::new();
    let owner = broker.connect();
    install_topology(&owner).await;

    let spec = QueueSpec::new("pause.bob", DIRECT_EXCHANGE, "pause").transient();
    let (_channel, _) = bind(&owner, &spec).await.unwrap();

    let other = broker.connect();
    let err = bind(&other, &spec).await.err().unwrap();
    assert!(matches!(err, AmqpError::DeclareQueueError { .. }));

    owner.close();
    assert!(!broker.queue_exists("pause.bob"));
    assert!(other.create_channel().await.is_ok());
}
