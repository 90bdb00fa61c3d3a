// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Consumption
//!
//! This module processes one delivered envelope end to end:
//! 1. Opens a trace span from the propagated context
//! 2. Decodes the payload with the subscription codec
//! 3. Invokes the handler
//! 4. Settles the envelope with exactly one ack or nack according to the
//!    handler decision, the requeue policy and the decode-failure policy
//!
//! Broker failures while settling are reported, never retried: the broker
//! redelivers unsettled messages on its own, which is the accepted
//! at-least-once behavior.

use crate::{
    broker::{BrokerChannel, Envelope},
    codec::Codec,
    errors::AmqpError,
    handler::{AckDecision, ConsumerHandler},
    otel,
    subscription::{DecodeFailurePolicy, RequeuePolicy},
};
use lapin::{
    types::{AMQPValue, DeliveryTag, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Header counting how many times a message was republished for a retry
pub const AMQP_HEADERS_REDELIVERY_COUNT: &str = "x-redelivery-count";
/// Exchange a message was first published to, kept across retries
pub const AMQP_HEADERS_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Routing key a message was first published with, kept across retries
pub const AMQP_HEADERS_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

/// Exchange used to send a message straight back to a named queue
const DEFAULT_EXCHANGE: &str = "";

/// What the subscription loop does after an envelope.
#[derive(Debug)]
pub(crate) enum Flow {
    Continue,
    /// Cancelled while the handler was running; the envelope is left
    /// unacknowledged
    Cancelled,
    Stop(AmqpError),
}

/// Out-of-band error reporting for a running subscription: every error is
/// logged and, when a sink is registered, forwarded to it.
pub(crate) struct FaultReporter {
    queue: String,
    sink: Option<UnboundedSender<AmqpError>>,
}

impl FaultReporter {
    pub(crate) fn new(queue: &str, sink: Option<UnboundedSender<AmqpError>>) -> Self {
        FaultReporter {
            queue: queue.to_owned(),
            sink,
        }
    }

    pub(crate) fn report(&self, err: AmqpError) {
        error!(
            error = err.to_string(),
            queue = self.queue,
            "subscription error"
        );

        if let Some(sink) = &self.sink {
            if sink.send(err).is_err() {
                debug!(queue = self.queue, "error sink is closed");
            }
        }
    }
}

/// Settles envelopes of one subscription.
pub(crate) struct EnvelopeConsumer<'c> {
    pub(crate) channel: &'c dyn BrokerChannel,
    pub(crate) queue: &'c str,
    pub(crate) decode_failure: DecodeFailurePolicy,
    pub(crate) requeue: RequeuePolicy,
    pub(crate) dead_letter: DeadLetter<'c>,
    pub(crate) reporter: &'c FaultReporter,
    pub(crate) cancel: &'c CancellationToken,
}

/// Dead-letter settings of the consumed queue.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DeadLetter<'c> {
    pub(crate) exchange: Option<&'c str>,
    pub(crate) routing_key: Option<&'c str>,
}

impl EnvelopeConsumer<'_> {
    /// Decodes, handles and settles one envelope.
    pub(crate) async fn consume<T, C, H>(
        &self,
        tracer: &BoxedTracer,
        envelope: Envelope,
        codec: &C,
        handler: &H,
    ) -> Flow
    where
        T: DeserializeOwned + Send + 'static,
        C: Codec,
        H: ConsumerHandler<T>,
    {
        let name = span_name(&envelope);
        let (ctx, mut span) = otel::new_span(&envelope.properties, tracer, &name);

        debug!(
            "received: {} - exchange: {}",
            envelope.routing_key, envelope.exchange,
        );

        let msg = match codec.decode::<T>(&envelope.data) {
            Ok(msg) => msg,
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to decode payload"),
                });
                self.reporter.report(err.clone());

                return match self.decode_failure {
                    DecodeFailurePolicy::Stop => Flow::Stop(err),
                    DecodeFailurePolicy::Discard => {
                        warn!(queue = self.queue, "discarding undecodable message");
                        self.nack(&mut span, envelope.delivery_tag, false).await;
                        Flow::Continue
                    }
                };
            }
        };

        let decision = tokio::select! {
            biased;
            decision = handler.exec(&ctx, msg) => decision,
            _ = self.cancel.cancelled() => {
                warn!(queue = self.queue, "cancelled while handling, message left unacked");
                span.set_status(Status::Error {
                    description: Cow::from("cancelled while handling"),
                });
                return Flow::Cancelled;
            }
        };
        debug!(?decision, "message handled");

        match decision {
            AckDecision::Ack => self.ack(&mut span, envelope.delivery_tag).await,
            AckDecision::NackDiscard => self.nack(&mut span, envelope.delivery_tag, false).await,
            AckDecision::NackRequeue => self.requeue(&mut span, &envelope).await,
        }

        Flow::Continue
    }

    async fn ack(&self, span: &mut BoxedSpan, delivery_tag: DeliveryTag) {
        match self.channel.basic_ack(delivery_tag).await {
            Err(e) => {
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                self.reporter
                    .report(AmqpError::AckMessageError(e.to_string()));
            }
            _ => span.set_status(Status::Ok),
        }
    }

    async fn nack(&self, span: &mut BoxedSpan, delivery_tag: DeliveryTag, requeue: bool) {
        if let Err(e) = self.channel.basic_nack(delivery_tag, requeue).await {
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });

            let err = if requeue {
                AmqpError::RequeuingMessageError(e.to_string())
            } else {
                AmqpError::NackMessageError(e.to_string())
            };
            self.reporter.report(err);
        }
    }

    async fn requeue(&self, span: &mut BoxedSpan, envelope: &Envelope) {
        let max_redeliveries = match self.requeue {
            RequeuePolicy::Unbounded => {
                self.nack(span, envelope.delivery_tag, true).await;
                return;
            }
            RequeuePolicy::Bounded { max_redeliveries } => i64::from(max_redeliveries),
        };

        let count = redelivery_count(&envelope.properties);
        if count >= max_redeliveries {
            self.dead_letter(span, envelope, count).await;
            return;
        }

        warn!(queue = self.queue, count = count, "handler asked for a retry, republishing");
        let properties = retry_properties(envelope, count.saturating_add(1));

        match self
            .channel
            .basic_publish(DEFAULT_EXCHANGE, self.queue, &envelope.data, properties)
            .await
        {
            Ok(_) => self.ack(span, envelope.delivery_tag).await,
            Err(e) => {
                warn!(
                    error = e.to_string(),
                    "failure to republish msg, falling back to broker requeue"
                );
                span.record_error(&e);
                self.nack(span, envelope.delivery_tag, true).await;
            }
        }
    }

    /// Retires a message that used up its redeliveries. Republished messages
    /// carry the queue name as routing key, so the message is sent to the
    /// dead-letter exchange explicitly under its original key.
    async fn dead_letter(&self, span: &mut BoxedSpan, envelope: &Envelope, count: i64) {
        let Some(exchange) = self.dead_letter.exchange else {
            warn!(
                queue = self.queue,
                count = count,
                "too many attempts and no dead-letter exchange, dropping message"
            );
            self.nack(span, envelope.delivery_tag, false).await;
            return;
        };

        let original_key = original_header(&envelope.properties, AMQP_HEADERS_ORIGINAL_ROUTING_KEY)
            .unwrap_or_else(|| envelope.routing_key.clone());
        let routing_key = self
            .dead_letter
            .routing_key
            .map(str::to_owned)
            .unwrap_or(original_key);

        warn!(
            queue = self.queue,
            count = count,
            exchange = exchange,
            key = routing_key,
            "too many attempts, dead-lettering message"
        );

        match self
            .channel
            .basic_publish(
                exchange,
                &routing_key,
                &envelope.data,
                envelope.properties.clone(),
            )
            .await
        {
            Ok(_) => self.ack(span, envelope.delivery_tag).await,
            Err(e) => {
                span.record_error(&e);
                self.reporter
                    .report(AmqpError::PublishingError(e.to_string()));
                self.nack(span, envelope.delivery_tag, false).await;
            }
        }
    }
}

fn span_name(envelope: &Envelope) -> String {
    match envelope.properties.kind() {
        Some(kind) => kind.as_str().to_owned(),
        None => envelope.routing_key.clone(),
    }
}

/// Number of redeliveries already attempted for a message: the larger of the
/// republish counter and the first `x-death` entry count.
pub(crate) fn redelivery_count(props: &BasicProperties) -> i64 {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    let republished = headers
        .inner()
        .get(AMQP_HEADERS_REDELIVERY_COUNT)
        .and_then(|value| value.as_long_long_int())
        .unwrap_or_default();

    let dead_lettered = match headers.inner().get(AMQP_HEADERS_X_DEATH) {
        Some(value) => match value.as_array() {
            Some(arr) => match arr.as_slice().first() {
                Some(value) => match value.as_field_table() {
                    Some(table) => match table.inner().get(AMQP_HEADERS_COUNT) {
                        Some(value) => value.as_long_long_int().unwrap_or_default(),
                        _ => 0,
                    },
                    _ => 0,
                },
                _ => 0,
            },
            _ => 0,
        },
        _ => 0,
    };

    republished.max(dead_lettered)
}

pub(crate) fn original_header(props: &BasicProperties, key: &str) -> Option<String> {
    props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(key))
        .and_then(|value| value.as_long_string())
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

/// Properties of a retried message: the bumped counter plus, on the first
/// retry, where the message was originally published.
fn retry_properties(envelope: &Envelope, count: i64) -> BasicProperties {
    let props = &envelope.properties;
    let mut headers = props.headers().clone().unwrap_or_default();
    headers.insert(
        ShortString::from(AMQP_HEADERS_REDELIVERY_COUNT),
        AMQPValue::LongLongInt(count),
    );

    if original_header(props, AMQP_HEADERS_ORIGINAL_ROUTING_KEY).is_none() {
        headers.insert(
            ShortString::from(AMQP_HEADERS_ORIGINAL_EXCHANGE),
            AMQPValue::LongString(LongString::from(envelope.exchange.as_str())),
        );
        headers.insert(
            ShortString::from(AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(envelope.routing_key.as_str())),
        );
    }

    props.clone().with_headers(headers)
}
