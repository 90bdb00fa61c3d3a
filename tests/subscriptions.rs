// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use amqp_pubsub::{
    broker::{memory::InMemoryBroker, Session},
    codec::{BincodeCodec, JsonCodec},
    errors::{AmqpError, ErrorKind},
    exchange::ExchangeDefinition,
    handler::{handler_fn, AckDecision, ConsumerHandler},
    publisher::{publish_once, Publisher},
    queue::QueueSpec,
    subscription::{
        subscribe_bincode, subscribe_json, DecodeFailurePolicy, RequeuePolicy, StopReason,
        Subscription, SubscriptionState,
    },
    topology::{bind, AmqpTopology, Topology},
    AMQP_HEADERS_ORIGINAL_ROUTING_KEY, AMQP_HEADERS_REDELIVERY_COUNT,
};
use async_trait::async_trait;
use common::*;
use lapin::{
    types::{AMQPValue, LongString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Semaphore};

/// Records every message it sees, optionally taking its time.
struct Recorder {
    seen: Arc<Mutex<Vec<u32>>>,
    delay: Duration,
}

#[async_trait]
impl ConsumerHandler<u32> for Recorder {
    async fn exec(&self, _ctx: &Context, msg: u32) -> AckDecision {
        tokio::time::sleep(self.delay).await;
        self.seen.lock().unwrap().push(msg);
        AckDecision::Ack
    }
}

/// Blocks on a semaphore before acknowledging.
struct Gated {
    gate: Arc<Semaphore>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ConsumerHandler<u32> for Gated {
    async fn exec(&self, _ctx: &Context, _msg: u32) -> AckDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        AckDecision::Ack
    }
}

#[tokio::test]
async fn published_state_reaches_the_subscriber() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let seen = Arc::new(Mutex::new(vec![]));
    let sink = seen.clone();
    let handle = subscribe_json(
        &session,
        QueueSpec::new("pause.alice", DIRECT_EXCHANGE, "pause").transient(),
        handler_fn(move |state: PlayingState| {
            sink.lock().unwrap().push(state);
            AckDecision::Ack
        }),
    )
    .await
    .unwrap();
    assert!(eventually(|| handle.state() == SubscriptionState::Running).await);

    publish_once(
        &session,
        DIRECT_EXCHANGE,
        "pause",
        &PlayingState { is_paused: true },
        &JsonCodec,
    )
    .await
    .unwrap();

    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
    assert_eq!(seen.lock().unwrap()[0], PlayingState { is_paused: true });
    assert!(eventually(|| broker.unacked_count("pause.alice") == 0).await);

    assert_eq!(handle.unsubscribe().await.unwrap(), StopReason::Clean);
}

#[tokio::test]
async fn binary_logs_reach_a_server_named_queue_through_a_topic() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let seen = Arc::new(Mutex::new(vec![]));
    let sink = seen.clone();
    let handle = subscribe_bincode(
        &session,
        QueueSpec::new("", TOPIC_EXCHANGE, "game_logs.*").transient(),
        handler_fn(move |log: GameLog| {
            sink.lock().unwrap().push(log);
            AckDecision::Ack
        }),
    )
    .await
    .unwrap();
    assert!(handle.queue().starts_with("amq.gen-"));

    let log = GameLog {
        current_time: 1_700_000_000,
        message: "alice won a war against bob".to_owned(),
        username: "alice".to_owned(),
    };
    let publisher = Publisher::new(session.create_channel().await.unwrap());
    publisher
        .publish(TOPIC_EXCHANGE, "game_logs.alice", &log, &BincodeCodec)
        .await
        .unwrap();
    publisher
        .publish(TOPIC_EXCHANGE, "moves.alice", &log, &BincodeCodec)
        .await
        .unwrap();

    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![log]);
}

#[tokio::test]
async fn requeued_message_is_redelivered() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let handler = handler_fn(move |_: PlayingState| {
        if counted.fetch_add(1, Ordering::SeqCst) == 0 {
            AckDecision::NackRequeue
        } else {
            AckDecision::Ack
        }
    });

    let handle = Subscription::new(
        QueueSpec::new("pause.bob", DIRECT_EXCHANGE, "pause"),
        JsonCodec,
        handler,
    )
    .requeue_policy(RequeuePolicy::Unbounded)
    .start(&session)
    .await
    .unwrap();

    publish_once(
        &session,
        DIRECT_EXCHANGE,
        "pause",
        &PlayingState { is_paused: false },
        &JsonCodec,
    )
    .await
    .unwrap();

    assert!(eventually(|| calls.load(Ordering::SeqCst) == 2).await);
    assert!(
        eventually(|| broker.ready_count("pause.bob") == 0 && broker.unacked_count("pause.bob") == 0)
            .await
    );
    handle.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn bounded_requeue_dead_letters_after_the_cap() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let handle = Subscription::new(
        QueueSpec::new("war", TOPIC_EXCHANGE, "war.*")
            .with_dead_letter_exchange(DEAD_LETTER_EXCHANGE),
        JsonCodec,
        handler_fn(move |_: String| {
            counted.fetch_add(1, Ordering::SeqCst);
            AckDecision::NackRequeue
        }),
    )
    .requeue_policy(RequeuePolicy::Bounded {
        max_redeliveries: 2,
    })
    .start(&session)
    .await
    .unwrap();

    publish_once(&session, TOPIC_EXCHANGE, "war.alice", "bob", &JsonCodec)
        .await
        .unwrap();

    assert!(eventually(|| broker.ready_count(DEAD_LETTER_QUEUE) == 1).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.ready_count("war"), 0);

    let headers = broker.peek_headers(DEAD_LETTER_QUEUE).unwrap();
    assert_eq!(
        headers.inner().get(AMQP_HEADERS_REDELIVERY_COUNT),
        Some(&AMQPValue::LongLongInt(2))
    );
    assert_eq!(
        headers.inner().get(AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
        Some(&AMQPValue::LongString(LongString::from("war.alice")))
    );

    handle.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_reach_a_key_routed_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let dlx = ExchangeDefinition::new("peril_dlx_direct").direct().durable();
    let alice_dead = QueueSpec::new("war_dead.alice", "peril_dlx_direct", "war.alice");
    let bob_dead = QueueSpec::new("war_dead.bob", "peril_dlx_direct", "war.bob");
    AmqpTopology::new(session.create_channel().await.unwrap())
        .exchange(&dlx)
        .queue(&alice_dead)
        .queue(&bob_dead)
        .install()
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let handle = Subscription::new(
        QueueSpec::new("war", TOPIC_EXCHANGE, "war.*").with_dead_letter_exchange("peril_dlx_direct"),
        JsonCodec,
        handler_fn(move |verdict: String| {
            counted.fetch_add(1, Ordering::SeqCst);
            if verdict == "reject" {
                AckDecision::NackDiscard
            } else {
                AckDecision::NackRequeue
            }
        }),
    )
    .requeue_policy(RequeuePolicy::Bounded {
        max_redeliveries: 1,
    })
    .start(&session)
    .await
    .unwrap();

    publish_once(&session, TOPIC_EXCHANGE, "war.alice", "reject", &JsonCodec)
        .await
        .unwrap();
    assert!(eventually(|| broker.ready_count("war_dead.alice") == 1).await);

    publish_once(&session, TOPIC_EXCHANGE, "war.alice", "retry", &JsonCodec)
        .await
        .unwrap();
    assert!(eventually(|| broker.ready_count("war_dead.alice") == 2).await);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.ready_count("war_dead.bob"), 0);
    assert_eq!(broker.ready_count("war"), 0);
    assert!(eventually(|| broker.unacked_count("war") == 0).await);

    handle.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_abandons_a_blocked_handler_and_requeues_its_message() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let gate = Arc::new(Semaphore::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = Subscription::new(
        QueueSpec::new("moves.stuck", DIRECT_EXCHANGE, "moves.stuck"),
        JsonCodec,
        Gated {
            gate,
            calls: calls.clone(),
        },
    )
    .start(&session)
    .await
    .unwrap();

    publish_once(&session, DIRECT_EXCHANGE, "moves.stuck", &1u32, &JsonCodec)
        .await
        .unwrap();
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 1).await);

    let reason = tokio::time::timeout(Duration::from_secs(2), handle.unsubscribe())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reason, StopReason::Clean);
    assert_eq!(broker.unacked_count("moves.stuck"), 0);
    assert_eq!(broker.ready_count("moves.stuck"), 1);
}

#[tokio::test]
async fn poison_message_is_discarded_and_the_subscription_continues() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let seen = Arc::new(Mutex::new(vec![]));
    let sink = seen.clone();
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let handle = Subscription::new(
        QueueSpec::new("pause.carol", DIRECT_EXCHANGE, "pause")
            .with_dead_letter_exchange(DEAD_LETTER_EXCHANGE),
        JsonCodec,
        handler_fn(move |state: PlayingState| {
            sink.lock().unwrap().push(state);
            AckDecision::Ack
        }),
    )
    .report_errors_to(errors_tx)
    .start(&session)
    .await
    .unwrap();

    let channel = session.create_channel().await.unwrap();
    channel
        .basic_publish(DIRECT_EXCHANGE, "pause", b"{not json", BasicProperties::default())
        .await
        .unwrap();
    publish_once(
        &session,
        DIRECT_EXCHANGE,
        "pause",
        &PlayingState { is_paused: true },
        &JsonCodec,
    )
    .await
    .unwrap();

    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
    assert_eq!(broker.ready_count(DEAD_LETTER_QUEUE), 1);
    assert_eq!(handle.state(), SubscriptionState::Running);

    let reported = errors_rx.recv().await.unwrap();
    assert_eq!(reported.kind(), ErrorKind::Decode);

    handle.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn poison_message_stops_the_subscription_when_asked_to() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let spec = QueueSpec::new("pause.dave", DIRECT_EXCHANGE, "pause");
    let (channel, _) = bind(&session, &spec).await.unwrap();

    channel
        .basic_publish(DIRECT_EXCHANGE, "pause", b"{not json", BasicProperties::default())
        .await
        .unwrap();
    publish_once(
        &session,
        DIRECT_EXCHANGE,
        "pause",
        &PlayingState { is_paused: true },
        &JsonCodec,
    )
    .await
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let handle = Subscription::new(
        spec,
        JsonCodec,
        handler_fn(move |_: PlayingState| {
            counted.fetch_add(1, Ordering::SeqCst);
            AckDecision::Ack
        }),
    )
    .on_decode_failure(DecodeFailurePolicy::Stop)
    .start(&session)
    .await
    .unwrap();

    let reason = handle.join().await.unwrap();
    assert!(matches!(reason, StopReason::Fault(AmqpError::DecodeError(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.ready_count("pause.dave"), 2);
    assert_eq!(broker.consumer_count("pause.dave"), 0);
}

#[tokio::test]
async fn concurrent_subscriptions_keep_their_own_order() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let fast = Arc::new(Mutex::new(vec![]));
    let slow = Arc::new(Mutex::new(vec![]));

    let mut handles = vec![];
    for (key, seen, delay) in [("fast", &fast, 0), ("slow", &slow, 5)] {
        let handle = Subscription::new(
            QueueSpec::new(key, DIRECT_EXCHANGE, key).transient(),
            JsonCodec,
            Recorder {
                seen: seen.clone(),
                delay: Duration::from_millis(delay),
            },
        )
        .prefetch(4)
        .start(&session)
        .await
        .unwrap();
        handles.push(handle);
    }

    let publisher = Publisher::new(session.create_channel().await.unwrap());
    for n in 0..20u32 {
        publisher
            .publish(DIRECT_EXCHANGE, "slow", &n, &JsonCodec)
            .await
            .unwrap();
        publisher
            .publish(DIRECT_EXCHANGE, "fast", &n, &JsonCodec)
            .await
            .unwrap();
    }

    assert!(eventually(|| fast.lock().unwrap().len() == 20 && slow.lock().unwrap().len() == 20).await);
    let expected: Vec<u32> = (0..20).collect();
    assert_eq!(*fast.lock().unwrap(), expected);
    assert_eq!(*slow.lock().unwrap(), expected);

    for handle in handles {
        handle.unsubscribe().await.unwrap();
    }
}

#[tokio::test]
async fn prefetch_limits_unacknowledged_deliveries() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let gate = Arc::new(Semaphore::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = Subscription::new(
        QueueSpec::new("moves", DIRECT_EXCHANGE, "moves"),
        JsonCodec,
        Gated {
            gate: gate.clone(),
            calls: calls.clone(),
        },
    )
    .prefetch(3)
    .start(&session)
    .await
    .unwrap();

    for n in 0..10u32 {
        publish_once(&session, DIRECT_EXCHANGE, "moves", &n, &JsonCodec)
            .await
            .unwrap();
    }

    assert!(eventually(|| calls.load(Ordering::SeqCst) == 1).await);
    assert_eq!(broker.unacked_count("moves"), 3);
    assert_eq!(broker.ready_count("moves"), 7);

    gate.add_permits(10);
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 10).await);
    assert!(eventually(|| broker.unacked_count("moves") == 0).await);
    assert_eq!(broker.ready_count("moves"), 0);

    handle.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_leaves_a_durable_queue_in_place() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();
    install_topology(&session).await;

    let handle = subscribe_json(
        &session,
        QueueSpec::new("pause.erin", DIRECT_EXCHANGE, "pause"),
        handler_fn(|_: PlayingState| AckDecision::Ack),
    )
    .await
    .unwrap();
    assert_eq!(broker.consumer_count("pause.erin"), 1);

    assert_eq!(handle.unsubscribe().await.unwrap(), StopReason::Clean);
    assert_eq!(broker.consumer_count("pause.erin"), 0);

    publish_once(
        &session,
        DIRECT_EXCHANGE,
        "pause",
        &PlayingState { is_paused: true },
        &JsonCodec,
    )
    .await
    .unwrap();
    assert_eq!(broker.ready_count("pause.erin"), 1);
}

#[tokio::test]
async fn closing_the_session_ends_transient_subscriptions() {
    let broker = InMemoryBroker::new();
    let admin = broker.connect();
    install_topology(&admin).await;

    let session = broker.connect();
    let mut handle = subscribe_json(
        &session,
        QueueSpec::new("pause.frank", DIRECT_EXCHANGE, "pause").transient(),
        handler_fn(|_: PlayingState| AckDecision::Ack),
    )
    .await
    .unwrap();
    assert!(broker.queue_exists("pause.frank"));

    session.close();

    assert_eq!(
        handle.stopped().await,
        SubscriptionState::Stopped(StopReason::Clean)
    );
    assert!(!broker.queue_exists("pause.frank"));
}

#[tokio::test]
async fn binding_to_a_missing_exchange_is_a_topology_error() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();

    let result = subscribe_json(
        &session,
        QueueSpec::new("pause.gina", "missing", "pause").transient(),
        handler_fn(|_: PlayingState| AckDecision::Ack),
    )
    .await;

    let err = result.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Topology);
    assert!(matches!(err, AmqpError::BindingExchangeToQueueError { .. }));
}

#[tokio::test]
async fn publishing_to_a_missing_exchange_fails() {
    let broker = InMemoryBroker::new();
    let session = broker.connect();

    let err = publish_once(&session, "missing", "pause", &true, &JsonCodec)
        .await
        .unwrap_err();

    assert!(matches!(err, AmqpError::PublishingError(_)));
}
