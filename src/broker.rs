// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The bus talks to the broker through three traits: a `Connector` that opens
//! connections, a `BrokerConnection` that hands out channels, and a
//! `BrokerChannel` exposing the AMQP operations the bus needs. The lapin
//! implementation lives in `channel`, the in-process one in `memory`.

use crate::{
    address::TlsOptions, errors::AmqpError, exchange::ExchangeKind, queue::QueueDefinition,
    registry::ConnectionKey,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

/// Value stored in a message header table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// Integer view; numeric strings are accepted as well.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::String(v) => v.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Transport-level properties sent along with a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    /// 0 to 9.
    pub priority: Option<u8>,
    pub reply_to: Option<String>,
    /// Milliseconds before the broker discards the message.
    pub expiration: Option<String>,
    pub headers: Headers,
    pub persistent: bool,
    pub content_type: Option<String>,
}

/// A message handed out by the broker, either pushed to a consumer or pulled
/// with `basic_get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A logical channel multiplexed over one broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        durable: bool,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), AmqpError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Returns the number of purged messages.
    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Pulls one message without auto-ack. `None` when the queue is empty.
    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn tx_select(&self) -> Result<(), AmqpError>;

    async fn tx_commit(&self) -> Result<(), AmqpError>;

    async fn tx_rollback(&self) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

/// A TCP connection to a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        key: &ConnectionKey,
        tls: &TlsOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}
