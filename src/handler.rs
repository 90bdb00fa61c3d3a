// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler receives one decoded message and answers with an [`AckDecision`].
//! Any side effect (persisting data, writing logs) belongs to the handler; the
//! subscription only acts on the returned decision. Because delivery is
//! at-least-once, handlers should be idempotent.

use crate::errors::AmqpError;
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;

/// The verdict of a handler on one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckDecision {
    /// Processed: remove the message from the queue
    Ack,
    /// Rejected: drop the message, or dead-letter it when the queue has a
    /// dead-letter exchange
    NackDiscard,
    /// Failed for now: make the message available for redelivery
    NackRequeue,
}

impl TryFrom<i64> for AckDecision {
    type Error = AmqpError;

    /// Decodes a raw decision code (`0` ack, `1` nack-discard, `2`
    /// nack-requeue).
    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(AckDecision::Ack),
            1 => Ok(AckDecision::NackDiscard),
            2 => Ok(AckDecision::NackRequeue),
            other => Err(AmqpError::ProtocolViolation(other)),
        }
    }
}

/// Processes messages of type `T`.
#[async_trait]
pub trait ConsumerHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Handles one message. `ctx` carries the trace context propagated by the
    /// publisher.
    async fn exec(&self, ctx: &Context, msg: T) -> AckDecision;
}

#[async_trait]
impl<T, H> ConsumerHandler<T> for Arc<H>
where
    T: Send + 'static,
    H: ConsumerHandler<T> + ?Sized,
{
    async fn exec(&self, ctx: &Context, msg: T) -> AckDecision {
        self.as_ref().exec(ctx, msg).await
    }
}

/// A handler backed by a plain function or closure.
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps `f` into a [`ConsumerHandler`].
///
/// ```ignore
/// let handler = handler_fn(|state: PlayingState| {
///     println!("paused: {}", state.is_paused);
///     AckDecision::Ack
/// });
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

#[async_trait]
impl<T, F> ConsumerHandler<T> for HandlerFn<F>
where
    T: Send + 'static,
    F: Fn(T) -> AckDecision + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, msg: T) -> AckDecision {
        (self.f)(msg)
    }
}
