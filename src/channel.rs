// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! lapin-backed implementation of the broker traits. `LapinConnector` opens
//! connections from a `ConnectionKey`; `LapinChannel` maps every channel
//! operation onto lapin and converts properties and header tables in both
//! directions.

use crate::{
    address::TlsOptions,
    broker::{
        BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream, HeaderValue,
        Headers, MessageProperties,
    },
    errors::AmqpError,
    exchange::ExchangeKind,
    queue::QueueDefinition,
    registry::ConnectionKey,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Default content type of bus payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

const DEFAULT_USER: &str = "guest";
const DEFAULT_VHOST: &str = "/";

/// Opens lapin connections.
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    pub fn new(connection_name: &str) -> LapinConnector {
        LapinConnector {
            connection_name: connection_name.to_owned(),
        }
    }
}

/// Builds the lapin URI of a connection key.
pub(crate) fn amqp_uri(key: &ConnectionKey, tls: &TlsOptions) -> String {
    let scheme = if tls.enabled { "amqps" } else { "amqp" };
    let user = if key.username.is_empty() {
        DEFAULT_USER
    } else {
        &key.username
    };
    let password = if key.password.is_empty() {
        DEFAULT_USER
    } else {
        &key.password
    };
    let vhost = if key.virtual_host.is_empty() {
        DEFAULT_VHOST
    } else {
        &key.virtual_host
    };

    format!(
        "{}://{}:{}@{}/{}",
        scheme,
        urlencoding::encode(user),
        urlencoding::encode(password),
        key.broker,
        urlencoding::encode(vhost)
    )
}

/// TLS settings lapin cannot honour. Its URI only switches to `amqps`: the
/// certificate is always checked against the broker host and the protocol
/// version is negotiated by the TLS backend.
pub(crate) fn ignored_tls_settings(key: &ConnectionKey, tls: &TlsOptions) -> Vec<&'static str> {
    let mut ignored = Vec::new();
    if !tls.enabled {
        return ignored;
    }
    let host = key.broker.split(':').next().unwrap_or_default();
    if !tls.server_name.is_empty() && !tls.server_name.eq_ignore_ascii_case(host) {
        ignored.push("server_name");
    }
    if tls.protocol.is_some() {
        ignored.push("protocol");
    }
    ignored
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        key: &ConnectionKey,
        tls: &TlsOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(broker = key.to_string(), "creating amqp connection...");
        let ignored = ignored_tls_settings(key, tls);
        if !ignored.is_empty() {
            warn!(
                broker = key.to_string(),
                settings = ignored.join(","),
                "tls settings not supported by lapin, ignoring"
            );
        }
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(&amqp_uri(key, tls), options).await {
            Ok(conn) => {
                debug!(broker = key.to_string(), "amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing the connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        durable: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                kind.arguments(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange = name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                AmqpError::UnbindingExchangeFromQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = queue, "error to purge queue");
                AmqpError::PurgeQueueError(queue.to_owned())
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                data,
                to_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Ok(msg) => Ok(msg.map(|m| from_lapin_delivery(&m.delivery))),
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "error getting message");
                Err(AmqpError::GetMessageError(queue.to_owned()))
            }
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(from_lapin_delivery(&delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error cancelling consumer");
                AmqpError::ConsumerError(err.to_string())
            })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.channel.tx_select().await.map_err(|err| {
            error!(error = err.to_string(), "error selecting tx mode");
            AmqpError::TxSelectError
        })
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        self.channel.tx_commit().await.map_err(|err| {
            error!(error = err.to_string(), "error committing channel");
            AmqpError::TxCommitError
        })
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        self.channel.tx_rollback().await.map_err(|err| {
            error!(error = err.to_string(), "error rolling back channel");
            AmqpError::TxRollbackError
        })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing the channel");
            AmqpError::ChannelError(err.to_string())
        })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

/// Maps bus properties onto lapin properties. Delivery is always persistent.
pub(crate) fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_delivery_mode(if props.persistent { 2 } else { 1 })
        .with_headers(to_field_table(&props.headers));

    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(reply_to) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(expiration) = &props.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }

    basic
}

pub(crate) fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        priority: *props.priority(),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        expiration: props.expiration().as_ref().map(|v| v.to_string()),
        headers: props
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        persistent: matches!(props.delivery_mode(), Some(2)),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
    }
}

fn from_lapin_delivery(delivery: &lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        data: delivery.data.clone(),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        };
        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

fn from_field_table(table: &FieldTable) -> Headers {
    let mut headers = Headers::new();

    for (key, value) in table.inner() {
        let header = match value {
            AMQPValue::LongString(v) => {
                HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(v) => HeaderValue::String(v.to_string()),
            AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
            AMQPValue::ShortShortInt(v) => HeaderValue::Int(*v as i64),
            AMQPValue::ShortShortUInt(v) => HeaderValue::Int(*v as i64),
            AMQPValue::ShortInt(v) => HeaderValue::Int(*v as i64),
            AMQPValue::ShortUInt(v) => HeaderValue::Int(*v as i64),
            AMQPValue::LongInt(v) => HeaderValue::Int(*v as i64),
            AMQPValue::LongUInt(v) => HeaderValue::Int(*v as i64),
            AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
            AMQPValue::Timestamp(v) => HeaderValue::Int(*v as i64),
            _ => {
                debug!(header = key.as_str(), "skipping unsupported header value");
                continue;
            }
        };
        headers.insert(key.to_string(), header);
    }

    headers
}
