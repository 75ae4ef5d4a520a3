// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process broker implementing the broker traits with the AMQP 0-9-1
//! semantics the bus relies on: default-exchange routing by queue name,
//! direct/topic/fanout/headers exchanges, the delayed-message exchange,
//! per-channel unacked tracking with redelivery, consumer prefetch and `tx`
//! channels whose publishes, acks and nacks only apply on commit.
//!
//! Used as the alternate transport for single-process deployments and as the
//! broker of the test suite. The inspection helpers (`queue_len`, `peek`,
//! `bindings`, `connections_opened`, `drop_connections`) are meant for tests
//! and operators.

use crate::{
    address::TlsOptions,
    broker::{
        BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream, MessageProperties,
    },
    errors::AmqpError,
    exchange::{ExchangeKind, AMQP_HEADERS_DELAY},
    queue::{QueueBinding, QueueDefinition},
    registry::ConnectionKey,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    data: Vec<u8>,
    redelivered: bool,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            data: self.data.clone(),
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

enum TxOp {
    Publish {
        exchange: String,
        routing_key: String,
        data: Vec<u8>,
        properties: MessageProperties,
    },
    Ack(u64),
    Nack(u64, bool),
}

#[derive(Default)]
struct ChannelState {
    connection: u64,
    prefetch: u16,
    unacked: Vec<(u64, String, StoredMessage)>,
    consumers: HashSet<String>,
    tx: Option<Vec<TxOp>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<QueueBinding>,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, ChannelState>,
    connections_opened: usize,
    next_id: u64,
    next_tag: u64,
}

impl State {
    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelState, AmqpError> {
        let connection = match self.channels.get(&id) {
            Some(channel) => channel.connection,
            None => return Err(AmqpError::ChannelClosed),
        };
        if !self.connections.get(&connection).copied().unwrap_or(false) {
            return Err(AmqpError::ChannelClosed);
        }
        self.channels.get_mut(&id).ok_or(AmqpError::ChannelClosed)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(messages) = self.queues.get_mut(queue) {
            messages.push_back(message);
        }
    }

    /// Routes a message to its queues. A positive `x-delay` on a delayed
    /// exchange defers routing; the delay is returned to the caller.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        properties: MessageProperties,
        honour_delay: bool,
    ) -> Result<Option<Duration>, AmqpError> {
        let expires_at = properties
            .expiration
            .as_ref()
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data,
            redelivered: false,
            expires_at,
        };

        if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                self.enqueue(routing_key, message);
            } else {
                debug!(routing_key = routing_key, "unroutable message dropped");
            }
            return Ok(None);
        }

        let kind = self
            .exchanges
            .get(exchange)
            .cloned()
            .ok_or_else(|| AmqpError::PublishingError(format!("no exchange '{}'", exchange)))?;

        if kind == ExchangeKind::XMessageDelayed && honour_delay {
            let delay = message
                .properties
                .headers
                .get(AMQP_HEADERS_DELAY)
                .and_then(|v| v.as_int())
                .unwrap_or(0);
            if delay > 0 {
                return Ok(Some(Duration::from_millis(delay as u64)));
            }
        }

        let mut targets: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Direct | ExchangeKind::XMessageDelayed => {
                    binding.routing_key == routing_key
                }
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        if targets.is_empty() {
            debug!(exchange = exchange, routing_key = routing_key, "unroutable message dropped");
        }
        for queue in targets {
            self.enqueue(&queue, message.clone());
        }
        Ok(None)
    }

    fn next_ready(&mut self, queue: &str) -> Option<StoredMessage> {
        let now = Instant::now();
        let messages = self.queues.get_mut(queue)?;
        while let Some(message) = messages.pop_front() {
            if !message.expired(now) {
                return Some(message);
            }
        }
        None
    }

    fn take(&mut self, channel: u64, queue: &str) -> Option<Delivery> {
        let message = self.next_ready(queue)?;
        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = message.delivery(tag);
        if let Some(state) = self.channels.get_mut(&channel) {
            state.unacked.push((tag, queue.to_owned(), message));
        }
        Some(delivery)
    }

    fn settle(&mut self, channel: u64, tag: u64, requeue: Option<bool>) -> Result<(), AmqpError> {
        let state = self.channel_mut(channel)?;
        let position = state
            .unacked
            .iter()
            .position(|(t, _, _)| *t == tag)
            .ok_or(match requeue {
                None => AmqpError::AckMessageError,
                Some(_) => AmqpError::NackMessageError,
            })?;
        let (_, queue, mut message) = state.unacked.remove(position);

        if requeue == Some(true) {
            message.redelivered = true;
            if let Some(messages) = self.queues.get_mut(&queue) {
                messages.push_front(message);
            }
        }
        Ok(())
    }

    /// Removes a channel, returning its unacked messages to their queues.
    fn drop_channel(&mut self, channel: u64) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };
        for (_, queue, mut message) in state.unacked.into_iter().rev() {
            message.redelivered = true;
            if let Some(messages) = self.queues.get_mut(&queue) {
                messages.push_front(message);
            }
        }
    }

    fn drop_connection(&mut self, connection: u64) {
        self.connections.insert(connection, false);
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.drop_channel(channel);
        }
    }
}

/// `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn schedule(&self, exchange: String, routing_key: String, data: Vec<u8>, properties: MessageProperties, delay: Duration) {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let routed = broker
                .state()
                .route(&exchange, &routing_key, data, properties, false);
            if let Err(err) = routed {
                warn!(error = err.to_string(), "dropping delayed message");
            }
            broker.notify.notify_waiters();
        });
    }

    fn publish_now(
        &self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let deferred = self.state().route(
            exchange,
            routing_key,
            data.clone(),
            properties.clone(),
            true,
        )?;
        if let Some(delay) = deferred {
            self.schedule(exchange.to_owned(), routing_key.to_owned(), data, properties, delay);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Number of messages ready for delivery.
    pub fn queue_len(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.state()
            .queues
            .get(queue)
            .map(|messages| messages.iter().filter(|m| !m.expired(now)).count())
            .unwrap_or(0)
    }

    /// Number of messages delivered on some channel and not yet settled.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.state()
            .channels
            .values()
            .flat_map(|c| c.unacked.iter())
            .filter(|(_, q, _)| q == queue)
            .count()
    }

    /// Copies of the ready messages of `queue`, head first, with tag 0.
    pub fn peek(&self, queue: &str) -> Vec<Delivery> {
        let now = Instant::now();
        self.state()
            .queues
            .get(queue)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| !m.expired(now))
                    .map(|m| m.delivery(0))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state().exchanges.get(exchange).cloned()
    }

    pub fn bindings(&self, queue: &str) -> Vec<QueueBinding> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .cloned()
            .collect()
    }

    /// Total number of connections ever opened.
    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    /// Severs every open connection as a network failure would.
    pub fn drop_connections(&self) {
        {
            let mut state = self.state();
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, open)| **open)
                .map(|(id, _)| *id)
                .collect();
            for connection in open {
                state.drop_connection(connection);
            }
        }
        self.notify.notify_waiters();
    }
}

pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        key: &ConnectionKey,
        _tls: &TlsOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let id = {
            let mut state = self.broker.state();
            state.next_id += 1;
            state.connections_opened += 1;
            let id = state.next_id;
            state.connections.insert(id, true);
            id
        };
        debug!(broker = key.to_string(), connection = id, "memory connection opened");
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.state();
        if !state.connections.get(&self.id).copied().unwrap_or(false) {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                ..ChannelState::default()
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_open(&self) -> bool {
        self.broker
            .state()
            .connections
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().drop_connection(self.id);
        self.broker.notify.notify_waiters();
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        _durable: bool,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.id)?;
        match state.exchanges.get(name) {
            Some(existing) if existing != kind => {
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), kind.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.id)?;
        state.queues.entry(def.name().to_owned()).or_default();
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.id)?;
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }
        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.id)?;
        state.bindings.retain(|b| {
            !(b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
        });
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.id)?;
        let messages = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::PurgeQueueError(queue.to_owned()))?;
        let purged = messages.len() as u32;
        messages.clear();
        Ok(purged)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.id)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        {
            let mut state = self.broker.state();
            let exists = exchange.is_empty() || state.exchanges.contains_key(exchange);
            let channel = state.channel_mut(self.id)?;
            // In tx mode a missing exchange only surfaces at commit.
            if let Some(ops) = channel.tx.as_mut() {
                ops.push(TxOp::Publish {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    data: data.to_vec(),
                    properties: properties.clone(),
                });
                return Ok(());
            }
            if !exists {
                return Err(AmqpError::PublishingError(format!(
                    "no exchange '{}'",
                    exchange
                )));
            }
        }
        self.broker
            .publish_now(exchange, routing_key, data.to_vec(), properties.clone())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::GetMessageError(queue.to_owned()));
        }
        Ok(state.take(self.id, queue))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        {
            let mut state = self.broker.state();
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
            state
                .channel_mut(self.id)?
                .consumers
                .insert(consumer_tag.to_owned());
        }

        let ctx = (
            self.broker.clone(),
            self.id,
            queue.to_owned(),
            consumer_tag.to_owned(),
        );
        Ok(stream::unfold(ctx, |(broker, channel, queue, tag)| async move {
            loop {
                let notify = broker.notify.clone();
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let mut state = broker.state();
                    let Ok(consumer) = state.channel_mut(channel) else {
                        return None;
                    };
                    if !consumer.consumers.contains(&tag) {
                        return None;
                    }
                    let free = consumer.prefetch == 0
                        || consumer.unacked.len() < consumer.prefetch as usize;
                    if free {
                        if let Some(delivery) = state.take(channel, &queue) {
                            drop(state);
                            return Some((Ok(delivery), (broker, channel, queue, tag)));
                        }
                    }
                }

                notified.await;
            }
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        {
            let mut state = self.broker.state();
            state.channel_mut(self.id)?.consumers.remove(consumer_tag);
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        {
            let mut state = self.broker.state();
            if let Some(ops) = state.channel_mut(self.id)?.tx.as_mut() {
                ops.push(TxOp::Ack(delivery_tag));
                return Ok(());
            }
            state.settle(self.id, delivery_tag, None)?;
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        {
            let mut state = self.broker.state();
            if let Some(ops) = state.channel_mut(self.id)?.tx.as_mut() {
                ops.push(TxOp::Nack(delivery_tag, requeue));
                return Ok(());
            }
            state.settle(self.id, delivery_tag, Some(requeue))?;
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        let channel = state.channel_mut(self.id)?;
        if channel.tx.is_none() {
            channel.tx = Some(vec![]);
        }
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        let mut deferred = vec![];
        {
            let mut state = self.broker.state();
            let ops = match state.channel_mut(self.id)?.tx.as_mut() {
                Some(ops) => std::mem::take(ops),
                None => return Err(AmqpError::TxCommitError),
            };
            let unroutable = ops.iter().any(|op| match op {
                TxOp::Publish { exchange, .. } => {
                    !exchange.is_empty() && !state.exchanges.contains_key(exchange)
                }
                _ => false,
            });
            if unroutable {
                warn!(channel = self.id, "commit refused, publish to a missing exchange");
                return Err(AmqpError::TxCommitError);
            }
            for op in ops {
                match op {
                    TxOp::Publish {
                        exchange,
                        routing_key,
                        data,
                        properties,
                    } => {
                        let delay = state.route(
                            &exchange,
                            &routing_key,
                            data.clone(),
                            properties.clone(),
                            true,
                        )?;
                        if let Some(delay) = delay {
                            deferred.push((exchange, routing_key, data, properties, delay));
                        }
                    }
                    TxOp::Ack(tag) => state.settle(self.id, tag, None)?,
                    TxOp::Nack(tag, requeue) => state.settle(self.id, tag, Some(requeue))?,
                }
            }
        }
        for (exchange, routing_key, data, properties, delay) in deferred {
            self.broker
                .schedule(exchange, routing_key, data, properties, delay);
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        match state.channel_mut(self.id)?.tx.as_mut() {
            Some(ops) => {
                ops.clear();
                Ok(())
            }
            None => Err(AmqpError::TxRollbackError),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().drop_channel(self.id);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state().channel_mut(self.id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::HeaderValue, registry::Protocol};

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let key = ConnectionKey {
            protocol: Protocol::Amqp,
            broker: "localhost".to_owned(),
            virtual_host: String::new(),
            username: String::new(),
            password: String::new(),
        };
        let conn = broker
            .connector()
            .connect(&key, &TlsOptions::default())
            .await
            .unwrap();
        conn.create_channel().await.unwrap()
    }

    async fn queue(channel: &Arc<dyn BrokerChannel>, name: &str) {
        channel
            .queue_declare(&QueueDefinition::new(name).durable())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        queue(&ch, "orders").await;

        ch.basic_publish("", "orders", b"a", &MessageProperties::default())
            .await
            .unwrap();
        ch.basic_publish("", "missing", b"b", &MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.queue_len("orders"), 1);
        assert_eq!(broker.peek("orders")[0].data, b"a");
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers_at_the_head() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        queue(&ch, "orders").await;
        for body in [b"1", b"2"] {
            ch.basic_publish("", "orders", body, &MessageProperties::default())
                .await
                .unwrap();
        }

        let first = ch.basic_get("orders").await.unwrap().unwrap();
        ch.basic_nack(first.delivery_tag, true).await.unwrap();
        let again = ch.basic_get("orders").await.unwrap().unwrap();

        assert_eq!(again.data, b"1");
        assert!(again.redelivered);
        ch.basic_ack(again.delivery_tag).await.unwrap();
        assert_eq!(broker.queue_len("orders"), 1);
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        queue(&ch, "orders").await;
        ch.basic_publish("", "orders", b"1", &MessageProperties::default())
            .await
            .unwrap();

        ch.basic_get("orders").await.unwrap().unwrap();
        assert_eq!(broker.unacked_len("orders"), 1);
        ch.close().await.unwrap();

        assert_eq!(broker.queue_len("orders"), 1);
        assert!(!ch.is_open());
    }

    #[tokio::test]
    async fn tx_buffers_until_commit() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        queue(&ch, "orders").await;
        ch.tx_select().await.unwrap();

        ch.basic_publish("", "orders", b"1", &MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_len("orders"), 0);
        ch.tx_rollback().await.unwrap();
        ch.tx_commit().await.unwrap();
        assert_eq!(broker.queue_len("orders"), 0);

        ch.basic_publish("", "orders", b"2", &MessageProperties::default())
            .await
            .unwrap();
        ch.tx_commit().await.unwrap();
        assert_eq!(broker.queue_len("orders"), 1);
    }

    #[tokio::test]
    async fn commit_to_a_missing_exchange_applies_nothing() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        queue(&ch, "orders").await;
        ch.tx_select().await.unwrap();

        let props = MessageProperties::default();
        ch.basic_publish("", "orders", b"1", &props).await.unwrap();
        ch.basic_publish("no-such-exchange", "x", b"2", &props)
            .await
            .unwrap();

        assert_eq!(ch.tx_commit().await, Err(AmqpError::TxCommitError));
        assert_eq!(broker.queue_len("orders"), 0);
    }

    #[tokio::test]
    async fn exchanges_route_through_bindings() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        queue(&ch, "a").await;
        queue(&ch, "b").await;
        ch.exchange_declare("direct", &ExchangeKind::Direct, true).await.unwrap();
        ch.exchange_declare("topic", &ExchangeKind::Topic, true).await.unwrap();
        ch.queue_bind("a", "direct", "Order").await.unwrap();
        ch.queue_bind("b", "topic", "orders.#").await.unwrap();

        let props = MessageProperties::default();
        ch.basic_publish("direct", "Order", b"x", &props).await.unwrap();
        ch.basic_publish("direct", "Invoice", b"x", &props).await.unwrap();
        ch.basic_publish("topic", "orders.eu.created", b"x", &props).await.unwrap();

        assert_eq!(broker.queue_len("a"), 1);
        assert_eq!(broker.queue_len("b"), 1);
        assert!(ch.basic_publish("nope", "x", b"x", &props).await.is_err());
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("a.*.c", "a.b.c"));
        assert!(topic_matches("#", "a.b"));
        assert!(topic_matches("a.#", "a"));
        assert!(!topic_matches("a.*", "a.b.c"));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_exchange_holds_messages() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        queue(&ch, "orders").await;
        ch.exchange_declare("delayed", &ExchangeKind::XMessageDelayed, true)
            .await
            .unwrap();
        ch.queue_bind("orders", "delayed", "orders").await.unwrap();

        let mut props = MessageProperties::default();
        props
            .headers
            .insert(AMQP_HEADERS_DELAY.to_owned(), HeaderValue::Int(500));
        ch.basic_publish("delayed", "orders", b"x", &props).await.unwrap();
        assert_eq!(broker.queue_len("orders"), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(broker.queue_len("orders"), 1);
    }

    #[tokio::test]
    async fn consumer_honours_prefetch() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        queue(&ch, "orders").await;
        ch.basic_qos(1).await.unwrap();
        for body in [b"1", b"2"] {
            ch.basic_publish("", "orders", body, &MessageProperties::default())
                .await
                .unwrap();
        }

        let mut deliveries = ch.basic_consume("orders", "c1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(blocked.is_err());

        ch.basic_ack(first.delivery_tag).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.data, b"2");

        ch.basic_cancel("c1").await.unwrap();
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_connections_close_their_channels() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        queue(&ch, "orders").await;

        broker.drop_connections();

        assert!(!ch.is_open());
        assert_eq!(
            ch.basic_get("orders").await.err(),
            Some(AmqpError::ChannelClosed)
        );
    }
}
