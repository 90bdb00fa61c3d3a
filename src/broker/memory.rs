// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process implementation of the session contract. It follows the
//! RabbitMQ exchange/queue model closely enough to exercise topology,
//! prefetch-bounded delivery, acknowledgment, requeue and dead-lettering
//! without a running server:
//!
//! - direct, fanout and topic exchanges plus the default (`""`) exchange
//! - durable, exclusive and auto-delete queues, reclaimed with their owner
//! - `x-dead-letter-exchange` / `x-dead-letter-routing-key` with an `x-death`
//!   header on every dead-lettered message
//! - per-channel prefetch limits; unacknowledged deliveries return to the head
//!   of their queue when the channel closes
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let session = broker.connect();
//! let channel = session.create_channel().await?;
//! ```

use super::{BrokerChannel, BrokerError, DeliveryStream, Envelope, QueueHandle, Session};
use crate::{
    consumer::{AMQP_HEADERS_COUNT, AMQP_HEADERS_X_DEATH},
    topology::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, DeliveryTag, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, ExchangeKind,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// The nameless exchange routing every message to the queue named by its key
pub const DEFAULT_EXCHANGE: &str = "";

const X_DEATH_QUEUE: &str = "queue";
const X_DEATH_REASON: &str = "reason";
const X_DEATH_EXCHANGE: &str = "exchange";
const REASON_REJECTED: &str = "rejected";

#[derive(Debug, Clone)]
enum Routing {
    Direct,
    Fanout,
    Topic,
    Unsupported,
}

impl From<ExchangeKind> for Routing {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => Routing::Direct,
            ExchangeKind::Fanout => Routing::Fanout,
            ExchangeKind::Topic => Routing::Topic,
            _ => Routing::Unsupported,
        }
    }
}

impl Routing {
    fn same_as(&self, other: &Routing) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn matches(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            Routing::Direct => binding_key == routing_key,
            Routing::Fanout => true,
            Routing::Topic => topic_matches(binding_key, routing_key),
            Routing::Unsupported => false,
        }
    }
}

/// Matches an AMQP topic pattern against a routing key. `*` stands for exactly
/// one dot-separated word and `#` for zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match key.get(skip..) {
            Some(tail) => words_match(rest, tail),
            None => false,
        }),
        Some((&"*", rest)) => match key.split_first() {
            Some((_, tail)) => words_match(rest, tail),
            None => false,
        },
        Some((word, rest)) => match key.split_first() {
            Some((head, tail)) if head == word => words_match(rest, tail),
            _ => false,
        },
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: BasicProperties,
    data: Vec<u8>,
}

struct QueueState {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    owner: u64,
    arguments: FieldTable,
    ready: VecDeque<StoredMessage>,
    had_consumer: bool,
    cursor: usize,
}

impl QueueState {
    fn check_access(&self, session: u64, name: &str) -> Result<(), BrokerError> {
        if self.exclusive && self.owner != session {
            return Err(BrokerError::new(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}'"
            )));
        }
        Ok(())
    }
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct ConsumerState {
    tag: String,
    queue: String,
    sender: mpsc::UnboundedSender<Result<Envelope, BrokerError>>,
}

struct ChannelState {
    session: u64,
    prefetch: u16,
    consumers: Vec<ConsumerState>,
    unacked: BTreeMap<DeliveryTag, (String, StoredMessage)>,
}

impl ChannelState {
    fn new(session: u64) -> Self {
        ChannelState {
            session,
            prefetch: 0,
            consumers: vec![],
            unacked: BTreeMap::new(),
        }
    }

    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    next_delivery_tag: DeliveryTag,
    exchanges: HashMap<String, Routing>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelState>,
    closed_sessions: HashSet<u64>,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn header_string(table: &FieldTable, key: &str) -> Option<String> {
    match table.inner().get(key) {
        Some(AMQPValue::LongString(value)) => {
            std::str::from_utf8(value.as_bytes()).ok().map(str::to_owned)
        }
        Some(AMQPValue::ShortString(value)) => Some(value.as_str().to_owned()),
        _ => None,
    }
}

fn not_found(what: &str, name: &str) -> BrokerError {
    BrokerError::new(format!("NOT_FOUND - no {what} '{name}'"))
}

fn inequivalent(arg: &str, queue: &str) -> BrokerError {
    BrokerError::new(format!(
        "PRECONDITION_FAILED - inequivalent arg '{arg}' for queue '{queue}'"
    ))
}

/// Records one more rejection of the message by `queue` in its `x-death`
/// header. The most recent entry is kept first.
fn with_death(properties: &BasicProperties, queue: &str, exchange: &str) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();

    let mut deaths: Vec<AMQPValue> = headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .map(|arr| arr.as_slice().to_vec())
        .unwrap_or_default();

    let existing = deaths.iter().position(|entry| match entry.as_field_table() {
        Some(table) => {
            header_string(table, X_DEATH_QUEUE).as_deref() == Some(queue)
                && header_string(table, X_DEATH_REASON).as_deref() == Some(REASON_REJECTED)
        }
        None => false,
    });

    let entry = match existing {
        Some(idx) => {
            let mut entry = deaths.remove(idx);
            if let AMQPValue::FieldTable(table) = &mut entry {
                let count = table
                    .inner()
                    .get(AMQP_HEADERS_COUNT)
                    .and_then(|value| value.as_long_long_int())
                    .unwrap_or_default();
                table.insert(
                    ShortString::from(AMQP_HEADERS_COUNT),
                    AMQPValue::LongLongInt(count.saturating_add(1)),
                );
            }
            entry
        }
        None => {
            let mut table = FieldTable::default();
            table.insert(
                ShortString::from(AMQP_HEADERS_COUNT),
                AMQPValue::LongLongInt(1),
            );
            table.insert(
                ShortString::from(X_DEATH_QUEUE),
                AMQPValue::LongString(LongString::from(queue)),
            );
            table.insert(
                ShortString::from(X_DEATH_REASON),
                AMQPValue::LongString(LongString::from(REASON_REJECTED)),
            );
            table.insert(
                ShortString::from(X_DEATH_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange)),
            );
            AMQPValue::FieldTable(table)
        }
    };
    deaths.insert(0, entry);

    headers.insert(
        ShortString::from(AMQP_HEADERS_X_DEATH),
        AMQPValue::FieldArray(FieldArray::from(deaths)),
    );

    properties.clone().with_headers(headers)
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    fn next_delivery_tag(&mut self) -> DeliveryTag {
        self.next_delivery_tag = self.next_delivery_tag.wrapping_add(1);
        self.next_delivery_tag
    }

    fn session_of(&self, channel: u64) -> Result<u64, BrokerError> {
        self.channels
            .get(&channel)
            .map(|ch| ch.session)
            .ok_or_else(|| BrokerError::new("CHANNEL_ERROR - channel is closed"))
    }

    fn consumer_count(&self, queue: &str) -> usize {
        self.channels
            .values()
            .flat_map(|ch| ch.consumers.iter())
            .filter(|consumer| consumer.queue == queue)
            .count()
    }

    fn handle(&self, name: &str) -> QueueHandle {
        let ready = self.queues.get(name).map(|q| q.ready.len()).unwrap_or(0);
        QueueHandle {
            name: name.to_owned(),
            message_count: u32::try_from(ready).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(self.consumer_count(name)).unwrap_or(u32::MAX),
        }
    }

    fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), BrokerError> {
        let routing = Routing::from(kind);

        match self.exchanges.get(name) {
            Some(existing) if !existing.same_as(&routing) && !options.passive => Err(
                BrokerError::new(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}'"
                )),
            ),
            Some(_) => Ok(()),
            None if options.passive => Err(not_found("exchange", name)),
            None => {
                self.exchanges.insert(name.to_owned(), routing);
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        session: u64,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueHandle, BrokerError> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_owned()
        };

        if let Some(existing) = self.queues.get(&name) {
            existing.check_access(session, &name)?;
            if options.passive {
                return Ok(self.handle(&name));
            }
            if existing.durable != options.durable {
                return Err(inequivalent("durable", &name));
            }
            if existing.exclusive != options.exclusive {
                return Err(inequivalent("exclusive", &name));
            }
            if existing.auto_delete != options.auto_delete {
                return Err(inequivalent("auto_delete", &name));
            }
            if header_string(&existing.arguments, AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
                != header_string(&arguments, AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
            {
                return Err(inequivalent(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, &name));
            }
            return Ok(self.handle(&name));
        }

        if options.passive {
            return Err(not_found("queue", &name));
        }

        self.queues.insert(
            name.clone(),
            QueueState {
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                owner: session,
                arguments,
                ready: VecDeque::new(),
                had_consumer: false,
                cursor: 0,
            },
        );
        debug!(queue = name, "memory broker declared queue");

        Ok(self.handle(&name))
    }

    fn bind_queue(
        &mut self,
        session: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let Some(state) = self.queues.get(queue) else {
            return Err(not_found("queue", queue));
        };
        state.check_access(session, queue)?;

        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::new(
                "ACCESS_REFUSED - operation not permitted on the default exchange",
            ));
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(not_found("exchange", exchange));
        }

        let duplicate = self.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !duplicate {
            self.bindings.push(Binding {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }

        Ok(())
    }

    fn consume(
        &mut self,
        channel: u64,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let session = self.session_of(channel)?;
        let Some(state) = self.queues.get_mut(queue) else {
            return Err(not_found("queue", queue));
        };
        state.check_access(session, queue)?;
        state.had_consumer = true;

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };

        let (sender, receiver) = mpsc::unbounded_channel();

        let Some(ch) = self.channels.get_mut(&channel) else {
            return Err(BrokerError::new("CHANNEL_ERROR - channel is closed"));
        };
        if ch.consumers.iter().any(|c| c.tag == tag) {
            return Err(BrokerError::new(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"
            )));
        }
        ch.consumers.push(ConsumerState {
            tag,
            queue: queue.to_owned(),
            sender,
        });

        self.dispatch();

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<(), BrokerError> {
        if exchange == DEFAULT_EXCHANGE {
            if let Some(queue) = self.queues.get_mut(routing_key) {
                queue.ready.push_back(message);
            }
            return Ok(());
        }

        let Some(routing) = self.exchanges.get(exchange) else {
            return Err(not_found("exchange", exchange));
        };

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && routing.matches(&b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
            }
        }

        Ok(())
    }

    fn settle(
        &mut self,
        channel: u64,
        delivery_tag: DeliveryTag,
    ) -> Result<(String, StoredMessage), BrokerError> {
        self.channels
            .get_mut(&channel)
            .and_then(|ch| ch.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                BrokerError::new(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                ))
            })
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_front(message);
        }
    }

    fn dead_letter(&mut self, queue: &str, message: StoredMessage) {
        let Some(state) = self.queues.get(queue) else {
            return;
        };
        let Some(exchange) = header_string(&state.arguments, AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
        else {
            debug!(queue = queue, "memory broker dropped rejected message");
            return;
        };
        let routing_key =
            header_string(&state.arguments, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                .unwrap_or_else(|| message.routing_key.clone());

        let dead = StoredMessage {
            properties: with_death(&message.properties, queue, &message.exchange),
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
            redelivered: false,
            data: message.data,
        };

        // an unknown dead-letter exchange drops the message, as RabbitMQ does
        if let Err(err) = self.route(&exchange, &routing_key, dead) {
            debug!(error = err.to_string(), "memory broker dropped dead letter");
        }
    }

    fn dispatch(&mut self) {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        for name in names {
            self.dispatch_queue(&name);
        }
    }

    fn dispatch_queue(&mut self, name: &str) {
        loop {
            let has_ready = self
                .queues
                .get(name)
                .map(|q| !q.ready.is_empty())
                .unwrap_or(false);
            if !has_ready {
                return;
            }

            let mut candidates: Vec<(u64, String)> = self
                .channels
                .iter()
                .filter(|(_, ch)| ch.has_capacity())
                .flat_map(|(id, ch)| {
                    ch.consumers
                        .iter()
                        .filter(|c| c.queue == name)
                        .map(move |c| (*id, c.tag.clone()))
                })
                .collect();
            if candidates.is_empty() {
                return;
            }
            candidates.sort();

            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            let pick = queue.cursor % candidates.len();
            queue.cursor = queue.cursor.wrapping_add(1);
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let Some((channel_id, tag)) = candidates.into_iter().nth(pick) else {
                return;
            };

            let delivery_tag = self.next_delivery_tag();
            let envelope = Envelope {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
            };

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            let delivered = channel
                .consumers
                .iter()
                .find(|c| c.tag == tag)
                .map(|c| c.sender.send(Ok(envelope)).is_ok())
                .unwrap_or(false);

            if delivered {
                channel.unacked.insert(delivery_tag, (name.to_owned(), message));
            } else {
                // the receiving side is gone: forget the consumer and retry
                channel.consumers.retain(|c| c.tag != tag);
                if let Some(queue) = self.queues.get_mut(name) {
                    queue.ready.push_front(message);
                }
            }
        }
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            self.bindings.retain(|b| b.queue != name);
            debug!(queue = name, "memory broker deleted queue");
        }
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };

        let touched: Vec<String> = channel.consumers.iter().map(|c| c.queue.clone()).collect();

        for (_, (queue, message)) in channel.unacked.into_iter().rev() {
            self.requeue(&queue, message);
        }

        for queue in touched {
            let unused = self
                .queues
                .get(&queue)
                .map(|q| q.auto_delete && q.had_consumer)
                .unwrap_or(false);
            if unused && self.consumer_count(&queue) == 0 {
                self.delete_queue(&queue);
            }
        }

        self.dispatch();
    }

    fn close_session(&mut self, session: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.session == session)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            self.close_channel(id);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive && q.owner == session)
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }

        self.closed_sessions.insert(session);
    }
}

/// In-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    /// Opens a new connection-like session.
    pub fn connect(&self) -> MemorySession {
        let id = lock(&self.state).next_id();
        MemorySession {
            id,
            state: self.state.clone(),
        }
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        lock(&self.state).exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    /// Messages waiting in the queue, not yet delivered to any consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered from the queue and not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|(name, _)| name == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.state).consumer_count(queue)
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.arguments.clone())
    }

    /// Headers of the message at the head of the queue.
    pub fn peek_headers(&self, queue: &str) -> Option<FieldTable> {
        lock(&self.state)
            .queues
            .get(queue)
            .and_then(|q| q.ready.front())
            .and_then(|m| m.properties.headers().clone())
    }
}

/// A connection to an [`InMemoryBroker`]. Closing it closes every channel it
/// opened and deletes the exclusive queues it owns.
pub struct MemorySession {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemorySession {
    pub fn close(&self) {
        lock(&self.state).close_session(self.id);
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let id = {
            let mut state = lock(&self.state);
            if state.closed_sessions.contains(&self.id) {
                return Err(BrokerError::new("CONNECTION_FORCED - connection is closed"));
            }
            let id = state.next_id();
            state.channels.insert(id, ChannelState::new(self.id));
            id
        };

        Ok(Arc::new(MemoryChannel {
            id,
            state: self.state.clone(),
        }))
    }
}

/// A channel of a [`MemorySession`]. Dropping it closes it.
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    fn with_state<R>(
        &self,
        op: impl FnOnce(&mut BrokerState, u64) -> Result<R, BrokerError>,
    ) -> Result<R, BrokerError> {
        let mut state = lock(&self.state);
        let session = state.session_of(self.id)?;
        op(&mut state, session)
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        lock(&self.state).close_channel(self.id);
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.with_state(|state, _| state.declare_exchange(exchange, kind, options))
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueHandle, BrokerError> {
        self.with_state(|state, session| state.declare_queue(session, queue, options, arguments))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.with_state(|state, session| state.bind_queue(session, queue, exchange, routing_key))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let id = self.id;
        self.with_state(|state, _| {
            if let Some(ch) = state.channels.get_mut(&id) {
                ch.prefetch = prefetch_count;
            }
            state.dispatch();
            Ok(())
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let id = self.id;
        self.with_state(|state, _| state.consume(id, queue, consumer_tag))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        self.with_state(|state, _| {
            let message = StoredMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                properties,
                data: payload.to_vec(),
            };
            state.route(exchange, routing_key, message)?;
            state.dispatch();
            Ok(())
        })
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        let id = self.id;
        self.with_state(|state, _| {
            state.settle(id, delivery_tag)?;
            state.dispatch();
            Ok(())
        })
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let id = self.id;
        self.with_state(|state, _| {
            let (queue, message) = state.settle(id, delivery_tag)?;
            if requeue {
                state.requeue(&queue, message);
            } else {
                state.dead_letter(&queue, message);
            }
            state.dispatch();
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.state).close_channel(self.id);
        Ok(())
    }
}
