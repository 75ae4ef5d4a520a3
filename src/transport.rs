// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport
//!
//! Sends batches to endpoint addresses and runs every delivery of the local
//! endpoint through the receive pipeline:
//!
//! 1. Shutdown markers are acknowledged and dropped.
//! 2. A fresh `Transaction` is created and the ack/nack of the delivery is
//!    enlisted in it.
//! 3. Messages whose retries are exhausted go to the error queue.
//! 4. The payload is decoded. A decode failure forwards it to the error queue.
//! 5. Each message of the batch is offered to the modules; an unclaimed
//!    ordinary message is sent to the discarded queue.
//! 6. Completion hooks run, then the transaction commits when nothing failed
//!    and rolls back otherwise.
//!
//! Sends issued with a transaction are published on that transaction's
//! channel when it commits; sends without one are published at once.

use crate::{
    address::{Address, SubQueue},
    broker::{BrokerChannel, Delivery},
    config::TransportConfig,
    consumer::{Consumer, DeliveryCallback},
    envelope::{CustomizeOutgoingMessages, Envelope, MessageBuilder, OutgoingMessageInformation},
    error_action::ErrorAction,
    errors::BusError,
    exchange::AMQP_HEADERS_DELAY,
    message::{BusMessage, JsonSerializer, MessageKind, MessageSerializer, Priority},
    module::{MessageContext, MessageInfo, MessageModule},
    otel,
    registry::ConnectionRegistry,
    topology::EndpointTopology,
    transaction::Transaction,
};
use futures_util::{
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    any::Any,
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, SystemTime},
};
use tokio::sync::Mutex;
use tracing::{debug, debug_span, error, info, warn, Instrument};

/// Delays at or below this are sent without going through the delay exchange.
const DELAY_THRESHOLD: Duration = Duration::from_millis(100);

struct Inner {
    config: TransportConfig,
    endpoint: Address,
    topology: EndpointTopology,
    registry: Arc<ConnectionRegistry>,
    builder: MessageBuilder,
    serializer: Arc<dyn MessageSerializer>,
    modules: Vec<Arc<dyn MessageModule>>,
    error_action: Arc<ErrorAction>,
    consumer: Mutex<Option<Consumer>>,
    started: AtomicBool,
    tracer: BoxedTracer,
}

/// Handle to a bus endpoint. Clones share the same transport.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

pub struct TransportBuilder {
    config: TransportConfig,
    registry: Option<Arc<ConnectionRegistry>>,
    serializer: Arc<dyn MessageSerializer>,
    customizers: Vec<Arc<dyn CustomizeOutgoingMessages>>,
    modules: Vec<Arc<dyn MessageModule>>,
}

impl TransportBuilder {
    pub fn new(config: TransportConfig) -> TransportBuilder {
        TransportBuilder {
            config,
            registry: None,
            serializer: Arc::new(JsonSerializer),
            customizers: vec![],
            modules: vec![],
        }
    }

    /// Connection registry to share. Defaults to one opening lapin connections.
    pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn customizer(mut self, customizer: Arc<dyn CustomizeOutgoingMessages>) -> Self {
        self.customizers.push(customizer);
        self
    }

    /// Registers a module. Modules run in registration order, after the
    /// built-in error action.
    pub fn module(mut self, module: Arc<dyn MessageModule>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn build(self) -> Result<Transport, BusError> {
        let endpoint = self.config.endpoint_address()?;

        let mut topology = EndpointTopology::new(&endpoint);
        if let Some(exchange) = &self.config.delay_exchange {
            topology = topology.delay_exchange(exchange);
        }

        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(ConnectionRegistry::lapin(&self.config.connection_name)),
        };

        let mut builder = MessageBuilder::new(self.serializer.clone(), endpoint.clone());
        for customizer in self.customizers {
            builder = builder.customizer(customizer);
        }

        let error_action = Arc::new(ErrorAction::new(self.config.number_of_retries));
        let mut modules: Vec<Arc<dyn MessageModule>> = vec![error_action.clone()];
        modules.extend(self.modules);

        Ok(Transport {
            inner: Arc::new(Inner {
                config: self.config,
                endpoint,
                topology,
                registry,
                builder,
                serializer: self.serializer,
                modules,
                error_action,
                consumer: Mutex::new(None),
                started: AtomicBool::new(false),
                tracer: global::tracer("rabbitbus"),
            }),
        })
    }
}

impl Transport {
    pub fn endpoint(&self) -> &Address {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn topology(&self) -> &EndpointTopology {
        &self.inner.topology
    }

    pub fn serializer(&self) -> &Arc<dyn MessageSerializer> {
        &self.inner.serializer
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn error_action(&self) -> &ErrorAction {
        &self.inner.error_action
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Installs the endpoint topology, notifies the modules, then starts
    /// consuming the endpoint queue.
    ///
    /// # Returns
    /// Ok(()) on success; topology or module failures abort the start
    pub async fn start(&self) -> Result<(), BusError> {
        if self.is_started() {
            return Ok(());
        }

        if self.inner.config.disable_queue_creation {
            debug!(endpoint = %self.inner.endpoint, "queue creation disabled");
        } else {
            self.inner.topology.install(&self.inner.registry).await?;
        }

        self.inner.started.store(true, Ordering::SeqCst);
        for module in &self.inner.modules {
            if let Err(err) = module.started(self).await {
                error!(error = err.to_string(), "module failed to start");
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        }

        let mut consumer = Consumer::new(
            self.inner.registry.clone(),
            self.inner.endpoint.clone(),
            self.inner.config.thread_count,
            self.inner.config.drain_timeout(),
        );
        if let Err(err) = consumer.start(self.delivery_callback()).await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(err);
        }
        *self.inner.consumer.lock().await = Some(consumer);

        info!(endpoint = %self.inner.endpoint, "transport started");
        Ok(())
    }

    /// Drains the consumer and closes every broker connection.
    pub async fn stop(&self) {
        let consumer = self.inner.consumer.lock().await.take();
        if let Some(mut consumer) = consumer {
            consumer.stop().await;
        }
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.registry.close().await;
        info!(endpoint = %self.inner.endpoint, "transport stopped");
    }

    fn delivery_callback(&self) -> DeliveryCallback {
        let transport: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |channel, delivery| {
            let transport = transport.clone();
            async move {
                let Some(inner) = transport.upgrade() else {
                    return;
                };
                Transport { inner }.receive(channel, delivery).await;
            }
            .boxed()
        })
    }

    fn ensure_started(&self) -> Result<(), BusError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(BusError::NotStarted)
        }
    }

    /// Sends `messages` to `destination`, within the current unit of work
    /// when one is in scope.
    ///
    /// # Returns
    /// The transport message id of the sent envelope
    pub async fn send(
        &self,
        destination: &Address,
        messages: Vec<BusMessage>,
    ) -> Result<String, BusError> {
        let ambient = Transaction::current();
        self.send_with(
            OutgoingMessageInformation::new(destination.clone(), messages),
            ambient.as_ref(),
        )
        .await
    }

    /// Sends `messages` when `tx` commits.
    pub async fn send_in(
        &self,
        tx: &Transaction,
        destination: &Address,
        messages: Vec<BusMessage>,
    ) -> Result<String, BusError> {
        self.send_with(
            OutgoingMessageInformation::new(destination.clone(), messages),
            Some(tx),
        )
        .await
    }

    /// Sends so that the destination receives the batch at `process_again_at`.
    ///
    /// Needs a configured delay exchange; without one the batch is sent at
    /// once.
    pub async fn send_at(
        &self,
        destination: &Address,
        process_again_at: SystemTime,
        messages: Vec<BusMessage>,
        tx: Option<&Transaction>,
    ) -> Result<String, BusError> {
        let delay = process_again_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        let mut info = OutgoingMessageInformation::new(destination.clone(), messages);

        if delay > DELAY_THRESHOLD {
            match self.inner.topology.delayed_exchange() {
                Some(exchange) => {
                    info = info.header(AMQP_HEADERS_DELAY, delay.as_millis() as i64);
                    if destination.exchange().is_empty() {
                        info.destination = Some(destination.with_exchange(exchange));
                    }
                }
                None => warn!(
                    destination = %destination,
                    "no delay exchange configured, sending without delay"
                ),
            }
        }

        self.send_with(info, tx).await
    }

    /// Sends a fully described batch, optionally within `tx`.
    pub async fn send_with(
        &self,
        mut info: OutgoingMessageInformation,
        tx: Option<&Transaction>,
    ) -> Result<String, BusError> {
        self.ensure_started()?;
        let Some(destination) = info.destination.clone() else {
            return Err(BusError::Transport("no destination given".to_owned()));
        };

        let envelope = self.inner.builder.build(&mut info)?;
        let routing_key = routing_key(&destination, &info.messages);
        self.publish(&destination, routing_key, &envelope, tx).await?;

        debug!(
            message_id = %envelope.message_id,
            destination = %destination,
            transactional = tx.is_some(),
            "message sent"
        );

        let mut sent = MessageInfo::new(&envelope, &destination);
        sent.messages = info.messages;
        for module in &self.inner.modules {
            module.message_sent(&sent).await;
        }

        Ok(envelope.message_id)
    }

    /// Forwards an envelope, unchanged, to the endpoint's error queue.
    pub async fn send_to_error_queue(
        &self,
        envelope: &Envelope,
        tx: Option<&Transaction>,
    ) -> Result<(), BusError> {
        let errors = self.inner.topology.error_queue();
        self.publish(errors, errors.queue().to_owned(), envelope, tx)
            .await
    }

    async fn publish(
        &self,
        destination: &Address,
        routing_key: String,
        envelope: &Envelope,
        tx: Option<&Transaction>,
    ) -> Result<(), BusError> {
        let channel = self.inner.registry.open(destination, tx).await?;
        let exchange = destination.exchange().to_owned();

        let Some(tx) = tx else {
            let published = channel
                .basic_publish(&exchange, &routing_key, &envelope.data, &envelope.to_properties())
                .await;
            channel.close().await?;
            return published.map_err(BusError::from);
        };

        let channel = channel.inner();
        let envelope = envelope.clone();
        tx.enlist(move |commit| async move {
            if commit {
                channel
                    .basic_publish(&exchange, &routing_key, &envelope.data, &envelope.to_properties())
                    .await?;
            }
            Ok::<(), BusError>(())
        });
        Ok(())
    }

    /// Pulls the envelopes waiting in the endpoint queue, or in one of its
    /// sub-queues, until it is empty.
    ///
    /// Each envelope is acknowledged when `tx` commits and requeued otherwise.
    pub async fn read_messages(
        &self,
        sub_queue: Option<SubQueue>,
        tx: &Transaction,
    ) -> Result<BoxStream<'static, Result<Envelope, BusError>>, BusError> {
        let address = match sub_queue {
            Some(kind) => self.inner.topology.sub_queue(kind).clone(),
            None => self.inner.endpoint.clone(),
        };
        let channel = self.inner.registry.open(&address, Some(tx)).await?.inner();
        let queue = address.queue().to_owned();

        let state = Some((channel, tx.clone(), queue));
        Ok(stream::unfold(state, |state| async move {
            let (channel, tx, queue) = state?;
            match channel.basic_get(&queue).await {
                Ok(Some(delivery)) => {
                    enlist_acknowledgement(&tx, channel.clone(), delivery.delivery_tag, true);
                    let envelope = Envelope::from_delivery(&delivery);
                    Some((Ok(envelope), Some((channel, tx, queue))))
                }
                Ok(None) => None,
                Err(err) => Some((Err(BusError::from(err)), None)),
            }
        })
        .boxed())
    }

    async fn receive(self, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
        let envelope = Envelope::from_delivery(&delivery);
        let span = debug_span!(
            "receive",
            message_id = %envelope.message_id,
            queue = self.inner.endpoint.queue(),
            redelivered = delivery.redelivered
        );
        self.process_delivery(channel, delivery.delivery_tag, envelope)
            .instrument(span)
            .await
    }

    async fn process_delivery(
        &self,
        channel: Arc<dyn BrokerChannel>,
        delivery_tag: u64,
        envelope: Envelope,
    ) {
        let kind = envelope.kind();
        let (trace_context, mut span) =
            otel::new_span(&envelope.headers, &self.inner.tracer, self.inner.endpoint.queue());

        if kind == MessageKind::Shutdown {
            debug!("shutdown marker received");
            if let Err(err) = channel.basic_ack(delivery_tag).await {
                error!(error = err.to_string(), "error whiling ack msg");
                span.record_error(&err);
            }
            span.end();
            return;
        }

        let administrative = kind == MessageKind::Administrative;
        let tx = Transaction::new();
        enlist_settlement(
            &tx,
            channel.clone(),
            delivery_tag,
            self.inner.config.consume_in_transaction,
        );

        let mut info = MessageInfo::new(&envelope, &self.inner.endpoint);
        let dispatched = AssertUnwindSafe(tx.clone().scope(self.dispatch(
            &mut info,
            administrative,
            &channel,
            &tx,
            &trace_context,
        )))
        .catch_unwind()
        .await;
        let mut failure = match dispatched {
            Ok(outcome) => outcome.err(),
            Err(panic) => Some(BusError::Processing(panic_message(panic.as_ref()))),
        };

        if failure.is_none() {
            if !administrative {
                for module in &self.inner.modules {
                    module.before_commit(&info).await;
                }
            }
            tx.complete();
            if let Err(err) = tx.prepare().await {
                error!(error = err.to_string(), "could not commit delivery");
                failure = Some(err);
            }
        }

        if let Some(err) = &failure {
            warn!(error = err.to_string(), "message processing failed");
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });

            if !self.inner.config.consume_in_transaction {
                self.requeue(&envelope).await;
            }
            for module in &self.inner.modules {
                module.processing_failure(&info, err).await;
            }
            if !administrative {
                for module in &self.inner.modules {
                    module.before_rollback(&info).await;
                }
            }
        } else {
            span.set_status(Status::Ok);
        }

        for module in &self.inner.modules {
            if administrative {
                module
                    .administrative_processing_completed(&info, failure.as_ref())
                    .await;
            } else {
                module.processing_completed(&info, failure.as_ref()).await;
            }
        }

        if let Err(err) = tx.dispose().await {
            error!(error = err.to_string(), "error disposing delivery transaction");
        }
        span.end();
    }

    /// Runs one delivery through the error action, the decoder and the
    /// modules. The returned error is the one the delivery failed with.
    async fn dispatch(
        &self,
        info: &mut MessageInfo,
        administrative: bool,
        channel: &Arc<dyn BrokerChannel>,
        tx: &Transaction,
        trace_context: &opentelemetry::Context,
    ) -> Result<(), BusError> {
        let error_action = &self.inner.error_action;
        if error_action.process(info, self, tx).await? {
            return Ok(());
        }

        let messages = match self.inner.serializer.deserialize(&info.envelope.data) {
            Ok(messages) => messages,
            Err(err) => {
                error!(error = err.to_string(), "could not decode message payload");
                for module in &self.inner.modules {
                    module.serialization_exception(info, &err).await;
                }
                if error_action.process(info, self, tx).await? {
                    return Ok(());
                }
                return Err(err);
            }
        };
        info.messages = messages.clone();

        for message in messages {
            let ctx = MessageContext {
                info: info.clone(),
                message,
                trace_context: trace_context.clone(),
                transport: self.clone(),
                transaction: tx.clone(),
                channel: channel.clone(),
            };

            if self.offer(&ctx, administrative).await? {
                continue;
            }
            if administrative {
                debug!(message_type = ctx.message.type_name(), "administrative message ignored");
            } else {
                self.discard(&ctx).await?;
            }
        }

        Ok(())
    }

    async fn offer(&self, ctx: &MessageContext, administrative: bool) -> Result<bool, BusError> {
        for module in &self.inner.modules {
            let claimed = if administrative {
                module.administrative_message_arrived(ctx).await?
            } else {
                module.message_arrived(ctx).await?
            };
            if claimed {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn discard(&self, ctx: &MessageContext) -> Result<(), BusError> {
        debug!(
            message_type = ctx.message.type_name(),
            "no module claimed the message, discarding"
        );
        let info = OutgoingMessageInformation::new(
            self.inner.topology.discarded_queue().clone(),
            vec![ctx.message.clone()],
        )
        .priority(Priority::Low);
        self.send_with(info, Some(&ctx.transaction)).await?;
        Ok(())
    }

    /// Puts a failed envelope back on the endpoint queue. Used when the
    /// endpoint does not consume in a transaction, where a failed delivery is
    /// dropped instead of requeued.
    async fn requeue(&self, envelope: &Envelope) {
        let endpoint = &self.inner.endpoint;
        let requeued = match self.inner.registry.open(endpoint, None).await {
            Ok(channel) => {
                let published = channel
                    .basic_publish("", endpoint.queue(), &envelope.data, &envelope.to_properties())
                    .await;
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "error closing channel");
                }
                published
            }
            Err(err) => Err(err),
        };
        if let Err(err) = requeued {
            error!(
                error = err.to_string(),
                message_id = %envelope.message_id,
                "could not requeue failed message"
            );
        }
    }
}

/// Acknowledges the inbound `delivery_tag` once everything `tx` published is
/// committed, rejects it otherwise.
fn enlist_settlement(
    tx: &Transaction,
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    requeue: bool,
) {
    tx.enlist_settlement(move |committed| async move {
        if committed {
            channel.basic_ack(delivery_tag).await?;
        } else {
            channel.basic_nack(delivery_tag, requeue).await?;
        }
        Ok::<(), BusError>(())
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|reason| (*reason).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    format!("handler panicked: {}", reason)
}

/// Acknowledges `delivery_tag` on the channel of `tx` when it commits,
/// rejects it otherwise.
fn enlist_acknowledgement(
    tx: &Transaction,
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    requeue: bool,
) {
    tx.enlist(move |commit| async move {
        if commit {
            channel.basic_ack(delivery_tag).await?;
        } else {
            channel.basic_nack(delivery_tag, requeue).await?;
        }
        Ok::<(), BusError>(())
    });
}

/// Queue name, else the first routing key, else the type of the first message.
fn routing_key(destination: &Address, messages: &[BusMessage]) -> String {
    if !destination.queue().is_empty() {
        return destination.queue().to_owned();
    }
    if let Some(key) = destination.routing_keys_list().first() {
        return (*key).to_owned();
    }
    messages
        .first()
        .map(|message| message.type_name().to_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::HeaderValue, memory::MemoryBroker};
    use async_trait::async_trait;
    use serde_json::json;

    struct Claim;

    #[async_trait]
    impl MessageModule for Claim {
        async fn message_arrived(&self, _ctx: &MessageContext) -> Result<bool, BusError> {
            Ok(true)
        }
    }

    fn order() -> BusMessage {
        BusMessage::new("Order", &json!({ "id": 7 })).unwrap()
    }

    fn transport(broker: &MemoryBroker, config: TransportConfig) -> Transport {
        TransportBuilder::new(config)
            .registry(Arc::new(ConnectionRegistry::new(broker.connector())))
            .build()
            .unwrap()
    }

    #[test]
    fn routing_key_falls_back_to_the_message_type() {
        let queue = Address::parse("rmq://localhost/orders").unwrap();
        assert_eq!(routing_key(&queue, &[order()]), "orders");

        let keyed = Address::parse("rmq://localhost/?routingKey=a%20b#ex").unwrap();
        assert_eq!(routing_key(&keyed, &[order()]), "a");

        let by_type = Address::parse("rmq://localhost/?routeByType=true#ex").unwrap();
        assert_eq!(routing_key(&by_type, &[order()]), "Order");
    }

    #[test]
    fn build_requires_an_endpoint() {
        let err = TransportBuilder::new(TransportConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[tokio::test]
    async fn send_requires_start() {
        let broker = MemoryBroker::new();
        let transport = transport(
            &broker,
            TransportConfig::new("rmq://localhost/orders").thread_count(0),
        );

        let err = transport
            .send(transport.endpoint(), vec![order()])
            .await
            .unwrap_err();
        assert_eq!(err, BusError::NotStarted);
    }

    #[tokio::test]
    async fn transactional_sends_publish_on_commit_only() {
        let broker = MemoryBroker::new();
        let transport = transport(
            &broker,
            TransportConfig::new("rmq://localhost/orders").thread_count(0),
        );
        transport.start().await.unwrap();
        let billing = Address::parse("rmq://localhost/billing").unwrap();
        transport
            .registry()
            .declare_queue(&billing, "billing")
            .await
            .unwrap();

        let rolled_back = Transaction::new();
        transport.send_in(&rolled_back, &billing, vec![order()]).await.unwrap();
        rolled_back.dispose().await.unwrap();
        assert_eq!(broker.queue_len("billing"), 0);

        let committed = Transaction::new();
        transport.send_in(&committed, &billing, vec![order()]).await.unwrap();
        transport.send_in(&committed, &billing, vec![order()]).await.unwrap();
        assert_eq!(broker.queue_len("billing"), 0);
        committed.complete();
        committed.dispose().await.unwrap();
        assert_eq!(broker.queue_len("billing"), 2);

        let sent = &broker.peek("billing")[0];
        assert_eq!(
            sent.properties.reply_to.as_deref(),
            Some("rmq://localhost/orders")
        );
        transport.stop().await;
    }

    #[tokio::test]
    async fn sends_join_the_transaction_in_scope() {
        let broker = MemoryBroker::new();
        let transport = transport(
            &broker,
            TransportConfig::new("rmq://localhost/orders").thread_count(0),
        );
        transport.start().await.unwrap();

        let tx = Transaction::new();
        tx.clone()
            .scope(async {
                transport
                    .send(transport.endpoint(), vec![order()])
                    .await
                    .unwrap();
            })
            .await;
        assert_eq!(broker.queue_len("orders"), 0);

        tx.complete();
        tx.dispose().await.unwrap();
        assert_eq!(broker.queue_len("orders"), 1);
        transport.stop().await;
    }

    #[tokio::test]
    async fn delayed_sends_carry_the_delay_header() {
        let broker = MemoryBroker::new();
        let transport = transport(
            &broker,
            TransportConfig::new("rmq://localhost/orders")
                .thread_count(0)
                .delay_exchange("delayed"),
        );
        transport.start().await.unwrap();

        let at = SystemTime::now() + Duration::from_millis(300);
        transport
            .send_at(transport.endpoint(), at, vec![order()], None)
            .await
            .unwrap();
        assert_eq!(broker.queue_len("orders"), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let delivered = broker.peek("orders");
        assert_eq!(delivered.len(), 1);
        assert!(matches!(
            delivered[0].properties.headers.get(AMQP_HEADERS_DELAY),
            Some(HeaderValue::Int(ms)) if *ms > 100 && *ms <= 300
        ));
        transport.stop().await;
    }

    #[tokio::test]
    async fn short_delays_are_sent_at_once() {
        let broker = MemoryBroker::new();
        let transport = transport(
            &broker,
            TransportConfig::new("rmq://localhost/orders")
                .thread_count(0)
                .delay_exchange("delayed"),
        );
        transport.start().await.unwrap();

        transport
            .send_at(transport.endpoint(), SystemTime::now(), vec![order()], None)
            .await
            .unwrap();

        assert_eq!(broker.queue_len("orders"), 1);
        assert!(broker.peek("orders")[0]
            .properties
            .headers
            .get(AMQP_HEADERS_DELAY)
            .is_none());
        transport.stop().await;
    }

    #[tokio::test]
    async fn read_messages_requeues_on_rollback() {
        let broker = MemoryBroker::new();
        let transport = transport(
            &broker,
            TransportConfig::new("rmq://localhost/orders").thread_count(0),
        );
        transport.start().await.unwrap();
        let errors = transport.topology().error_queue().clone();
        transport.send(&errors, vec![order()]).await.unwrap();
        transport.send(&errors, vec![order()]).await.unwrap();

        let tx = Transaction::new();
        let read: Vec<_> = transport
            .read_messages(Some(SubQueue::Errors), &tx)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(read.len(), 2);
        tx.dispose().await.unwrap();
        assert_eq!(broker.queue_len("orders.errors"), 2);

        let tx = Transaction::new();
        let read: Vec<_> = transport
            .read_messages(Some(SubQueue::Errors), &tx)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(read.len(), 2);
        tx.complete();
        tx.dispose().await.unwrap();
        assert_eq!(broker.queue_len("orders.errors"), 0);
        transport.stop().await;
    }

    #[tokio::test]
    async fn claimed_messages_are_acknowledged() {
        let broker = MemoryBroker::new();
        let transport = TransportBuilder::new(TransportConfig::new("rmq://localhost/orders"))
            .registry(Arc::new(ConnectionRegistry::new(broker.connector())))
            .module(Arc::new(Claim))
            .build()
            .unwrap();
        transport.start().await.unwrap();

        transport
            .send(transport.endpoint(), vec![order()])
            .await
            .unwrap();

        for _ in 0..100 {
            if broker.queue_len("orders") == 0 && broker.unacked_len("orders") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.queue_len("orders"), 0);
        assert_eq!(broker.unacked_len("orders"), 0);
        assert_eq!(broker.queue_len("orders.discarded"), 0);
        transport.stop().await;
    }
}
