// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Runner
//!
//! A [`Subscription`] binds a queue, limits the number of unacknowledged
//! deliveries with a prefetch window and spawns one consumption task that
//! processes envelopes strictly one after the other, in delivery order.
//!
//! ```text
//! Created --bind+qos+consume--> Bound --task started--> Running
//! Running --stream closed | unsubscribe--> Stopped(Clean)
//! Running --decode failure (Stop policy)--> Stopped(Fault)
//! ```
//!
//! Every subscription owns its channel. Subscriptions never share channels,
//! queues or handler state, so any number of them can run side by side.

use crate::{
    broker::{BrokerChannel, DeliveryStream, Session},
    codec::{BincodeCodec, Codec, JsonCodec},
    consumer::{DeadLetter, EnvelopeConsumer, FaultReporter, Flow},
    errors::AmqpError,
    handler::ConsumerHandler,
    queue::QueueSpec,
    topology::{bind, close_channel},
};
use futures_util::{future::join_all, StreamExt};
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, sync::Arc};
use tokio::{
    sync::{mpsc::UnboundedSender, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default number of unacknowledged deliveries per subscription
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;
/// Default redelivery cap of [`RequeuePolicy::Bounded`]
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// What a subscription does with a payload its codec cannot decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Nack without requeue (dead-lettered when configured) and keep going
    #[default]
    Discard,
    /// Stop the subscription, leaving the message unacknowledged
    Stop,
}

/// How `NackRequeue` decisions are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeuePolicy {
    /// Broker requeue, as many times as the handler asks for it
    Unbounded,
    /// Republish to the same queue with a redelivery counter. Once the counter
    /// reaches `max_redeliveries` the message goes to the queue's dead-letter
    /// exchange under its original routing key, or is nacked without requeue
    /// when the queue has none.
    Bounded { max_redeliveries: u32 },
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        RequeuePolicy::Bounded {
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Delivery stream closed or the subscription was cancelled
    Clean,
    Fault(AmqpError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Bound,
    Running,
    Stopped(StopReason),
}

/// A queue subscription waiting to be started.
pub struct Subscription<T, C, H> {
    spec: QueueSpec,
    codec: C,
    handler: H,
    prefetch: u16,
    consumer_tag: Option<String>,
    decode_failure: DecodeFailurePolicy,
    requeue: RequeuePolicy,
    errors: Option<UnboundedSender<AmqpError>>,
    _msg: PhantomData<fn() -> T>,
}

impl<T, C, H> Subscription<T, C, H>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec + 'static,
    H: ConsumerHandler<T> + 'static,
{
    pub fn new(spec: QueueSpec, codec: C, handler: H) -> Self {
        Subscription {
            spec,
            codec,
            handler,
            prefetch: DEFAULT_PREFETCH_COUNT,
            consumer_tag: None,
            decode_failure: DecodeFailurePolicy::default(),
            requeue: RequeuePolicy::default(),
            errors: None,
            _msg: PhantomData,
        }
    }

    /// Maximum number of delivered but unacknowledged messages.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = count;
        self
    }

    /// Consumer tag registered with the broker. Defaults to the queue name
    /// followed by a random suffix.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn on_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure = policy;
        self
    }

    pub fn requeue_policy(mut self, policy: RequeuePolicy) -> Self {
        self.requeue = policy;
        self
    }

    /// Forwards every runtime error of the running subscription to `sink`.
    pub fn report_errors_to(mut self, sink: UnboundedSender<AmqpError>) -> Self {
        self.errors = Some(sink);
        self
    }

    pub fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    /// Binds the queue, applies the prefetch limit, registers the consumer and
    /// spawns the consumption task.
    ///
    /// # Parameters
    /// * `session` - Session the subscription opens its own channel on
    ///
    /// # Returns
    /// * `Ok(SubscriptionHandle)` controlling the running subscription
    /// * `Err(AmqpError)` of kind `Topology` when the queue cannot be declared,
    ///   bound or consumed from. The channel opened for the subscription is
    ///   closed before the error is returned.
    pub async fn start(self, session: &dyn Session) -> Result<SubscriptionHandle, AmqpError> {
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Created);

        let (channel, queue) = bind(session, &self.spec).await?;

        if let Err(err) = channel.basic_qos(self.prefetch).await {
            error!(error = err.to_string(), "error to define the prefetch count");
            close_channel(channel.as_ref()).await;
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let consumer_tag = self
            .consumer_tag
            .unwrap_or_else(|| format!("{}-{}", queue.name, Uuid::new_v4()));

        let deliveries = match channel.basic_consume(&queue.name, &consumer_tag).await {
            Ok(d) => d,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue.name,
                    "error to create the consumer"
                );
                close_channel(channel.as_ref()).await;
                return Err(AmqpError::BindingConsumerError {
                    queue: queue.name,
                    reason: err.to_string(),
                });
            }
        };

        state_tx.send_replace(SubscriptionState::Bound);
        debug!(
            queue = queue.name,
            consumer_tag = consumer_tag,
            prefetch = self.prefetch,
            "subscription bound"
        );

        let cancel = CancellationToken::new();
        let runner = Runner {
            reporter: FaultReporter::new(&queue.name, self.errors),
            channel,
            queue: queue.name.clone(),
            codec: self.codec,
            handler: self.handler,
            decode_failure: self.decode_failure,
            requeue: self.requeue,
            dead_letter_exchange: self.spec.dead_letter_exchange.clone(),
            dead_letter_routing_key: self.spec.dead_letter_routing_key.clone(),
            state: state_tx,
            _msg: PhantomData,
        };
        let task = tokio::spawn(runner.run(deliveries, cancel.clone()));

        Ok(SubscriptionHandle {
            queue: queue.name,
            consumer_tag,
            cancel,
            state: state_rx,
            task,
        })
    }
}

/// Subscribes `handler` to the queue described by `spec`, decoding JSON
/// payloads with default options.
pub async fn subscribe_json<T, H>(
    session: &dyn Session,
    spec: QueueSpec,
    handler: H,
) -> Result<SubscriptionHandle, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + 'static,
{
    Subscription::new(spec, JsonCodec, handler)
        .start(session)
        .await
}

/// Same as [`subscribe_json`] for binary payloads.
pub async fn subscribe_bincode<T, H>(
    session: &dyn Session,
    spec: QueueSpec,
    handler: H,
) -> Result<SubscriptionHandle, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + 'static,
{
    Subscription::new(spec, BincodeCodec, handler)
        .start(session)
        .await
}

/// Control over a running subscription.
///
/// Dropping the handle detaches the task: the subscription keeps running until
/// its delivery stream closes or its cancellation token fires.
pub struct SubscriptionHandle {
    queue: String,
    consumer_tag: String,
    cancel: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
    task: JoinHandle<StopReason>,
}

impl SubscriptionHandle {
    /// Name of the consumed queue, as reported by the broker.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// A token stopping this subscription when cancelled. Child tokens of an
    /// application-wide token can be wired in the same way.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits until the subscription reaches `Stopped`.
    pub async fn stopped(&mut self) -> SubscriptionState {
        let stopped = self
            .state
            .wait_for(|state| matches!(state, SubscriptionState::Stopped(_)))
            .await
            .map(|state| (*state).clone());

        match stopped {
            Ok(state) => state,
            Err(_) => self.state.borrow().clone(),
        }
    }

    /// Stops the subscription and waits for its task to finish.
    ///
    /// A handler still running is abandoned: its envelope stays
    /// unacknowledged and the broker requeues it when the channel closes.
    pub async fn unsubscribe(self) -> Result<StopReason, AmqpError> {
        debug!(queue = self.queue, "unsubscribing");
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the consumption task to finish.
    pub async fn join(self) -> Result<StopReason, AmqpError> {
        self.task.await.map_err(|err| {
            error!(error = err.to_string(), "tokio process error");
            AmqpError::InternalError(err.to_string())
        })
    }
}

/// Waits for every subscription in `handles` to finish.
pub async fn join_subscriptions(
    handles: Vec<SubscriptionHandle>,
) -> Vec<Result<StopReason, AmqpError>> {
    join_all(handles.into_iter().map(SubscriptionHandle::join)).await
}

struct Runner<T, C, H> {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    codec: C,
    handler: H,
    decode_failure: DecodeFailurePolicy,
    requeue: RequeuePolicy,
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
    reporter: FaultReporter,
    state: watch::Sender<SubscriptionState>,
    _msg: PhantomData<fn() -> T>,
}

impl<T, C, H> Runner<T, C, H>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: ConsumerHandler<T>,
{
    async fn run(self, mut deliveries: DeliveryStream, cancel: CancellationToken) -> StopReason {
        self.state.send_replace(SubscriptionState::Running);

        let tracer = global::tracer("amqp consumer");
        let consumer = EnvelopeConsumer {
            channel: self.channel.as_ref(),
            queue: &self.queue,
            decode_failure: self.decode_failure,
            requeue: self.requeue,
            dead_letter: DeadLetter {
                exchange: self.dead_letter_exchange.as_deref(),
                routing_key: self.dead_letter_routing_key.as_deref(),
            },
            reporter: &self.reporter,
            cancel: &cancel,
        };

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(queue = self.queue, "subscription cancelled");
                    break StopReason::Clean;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(envelope)) => {
                    match consumer
                        .consume(&tracer, envelope, &self.codec, &self.handler)
                        .await
                    {
                        Flow::Continue => {}
                        Flow::Cancelled => break StopReason::Clean,
                        Flow::Stop(err) => {
                            warn!(queue = self.queue, "subscription stopped on failure");
                            break StopReason::Fault(err);
                        }
                    }
                }
                Some(Err(err)) => self
                    .reporter
                    .report(AmqpError::ConsumerError(err.to_string())),
                None => {
                    debug!(queue = self.queue, "delivery stream closed");
                    break StopReason::Clean;
                }
            }
        };

        drop(deliveries);
        close_channel(self.channel.as_ref()).await;
        self.state
            .send_replace(SubscriptionState::Stopped(reason.clone()));

        reason
    }
}
