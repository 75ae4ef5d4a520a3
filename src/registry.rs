// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Registry
//!
//! Owns every broker connection the bus opened, keyed by normalized broker
//! identity, and hands out channels over them. Non-transactional channels are
//! fresh per operation. Transactional channels are cached inside the unit of
//! work's `Transaction` so that every publish of one unit of work shares a
//! single channel and commits with it.

use crate::{
    address::{Address, TlsOptions},
    broker::{BrokerChannel, BrokerConnection, Connector},
    channel::LapinConnector,
    errors::AmqpError,
    exchange::ExchangeKind,
    queue::QueueDefinition,
    transaction::Transaction,
};
use std::{collections::HashMap, fmt, ops::Deref, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LOCALHOST: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Amqp,
    Amqps,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Amqp => write!(f, "amqp"),
            Protocol::Amqps => write!(f, "amqps"),
        }
    }
}

/// Identity of a broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub protocol: Protocol,
    /// `host[:port]`, with the local machine name replaced by `localhost`.
    pub broker: String,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if !self.username.is_empty() {
            write!(f, "{}@", self.username)?;
        }
        write!(f, "{}/{}", self.broker, self.virtual_host)
    }
}

/// A channel handed out by the registry.
///
/// Transactional channels belong to their transaction, which commits and
/// closes them on disposal; `close` on such a handle does nothing.
pub struct OpenedChannel {
    channel: Arc<dyn BrokerChannel>,
    transactional: bool,
}

impl OpenedChannel {
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn inner(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.transactional {
            return Ok(());
        }
        self.channel.close().await
    }
}

impl Deref for OpenedChannel {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<ConnectionKey, Arc<dyn BrokerConnection>>>,
    local_name: String,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> ConnectionRegistry {
        let local_name = hostname::get()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        ConnectionRegistry {
            connector,
            connections: Mutex::new(HashMap::new()),
            local_name,
        }
    }

    /// Registry opening real broker connections named `connection_name`.
    pub fn lapin(connection_name: &str) -> ConnectionRegistry {
        Self::new(Arc::new(LapinConnector::new(connection_name)))
    }

    #[cfg(test)]
    pub(crate) fn with_local_name(mut self, name: &str) -> Self {
        self.local_name = name.to_lowercase();
        self
    }

    pub fn connection_key(&self, addr: &Address) -> ConnectionKey {
        let host = addr.host();
        let host = if !self.local_name.is_empty() && host == self.local_name {
            LOCALHOST
        } else {
            host
        };
        let broker = match addr.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_owned(),
        };

        ConnectionKey {
            protocol: if addr.tls().enabled {
                Protocol::Amqps
            } else {
                Protocol::Amqp
            },
            broker,
            virtual_host: addr.virtual_host().to_owned(),
            username: addr.username().to_owned(),
            password: addr.password().to_owned(),
        }
    }

    async fn connection(
        &self,
        key: &ConnectionKey,
        tls: &TlsOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut connections = self.connections.lock().await;

        if let Some(conn) = connections.get(key) {
            if conn.is_open() {
                return Ok(conn.clone());
            }
            warn!(broker = key.to_string(), "cached connection closed, reconnecting");
        }

        let conn = self.connector.connect(key, tls).await?;
        debug!(broker = key.to_string(), "opened new connection");
        connections.insert(key.clone(), conn.clone());
        Ok(conn)
    }

    async fn open_new(&self, key: &ConnectionKey, tls: &TlsOptions) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let conn = self.connection(key, tls).await?;
        match conn.create_channel().await {
            Ok(channel) => Ok(channel),
            // The connection may have dropped between the health check and
            // the channel request; retry once on a fresh one.
            Err(_) if !conn.is_open() => self.connection(key, tls).await?.create_channel().await,
            Err(err) => Err(err),
        }
    }

    /// Opens a channel to the broker of `addr`.
    ///
    /// With a transaction, the channel of that unit of work is reused, or
    /// opened in tx mode and handed to the transaction.
    pub async fn open(
        &self,
        addr: &Address,
        tx: Option<&Transaction>,
    ) -> Result<OpenedChannel, AmqpError> {
        let key = self.connection_key(addr);

        let Some(tx) = tx else {
            return Ok(OpenedChannel {
                channel: self.open_new(&key, addr.tls()).await?,
                transactional: false,
            });
        };

        if let Some(channel) = tx.channel(&key) {
            return Ok(OpenedChannel {
                channel,
                transactional: true,
            });
        }

        let channel = self.open_new(&key, addr.tls()).await?;
        channel.tx_select().await?;
        tx.add_channel(key, channel.clone());

        Ok(OpenedChannel {
            channel,
            transactional: true,
        })
    }

    pub async fn declare_exchange(
        &self,
        addr: &Address,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<(), AmqpError> {
        if exchange.is_empty() {
            info!("no exchange provided, not attempting declare");
            return Ok(());
        }

        let channel = self.open(addr, None).await?;
        info!(exchange = exchange, kind = ?kind, broker = addr.broker(), "declaring exchange");
        let declared = channel.exchange_declare(exchange, &kind, true).await;
        channel.close().await?;
        declared
    }

    pub async fn declare_queue(&self, addr: &Address, queue: &str) -> Result<(), AmqpError> {
        if queue.is_empty() {
            info!("no queue provided, not attempting declare");
            return Ok(());
        }

        let channel = self.open(addr, None).await?;
        info!(queue = queue, broker = addr.broker(), "declaring queue");
        let declared = channel
            .queue_declare(&QueueDefinition::new(queue).durable())
            .await;
        channel.close().await?;
        declared
    }

    /// Binds `queue` to `exchange` once per space-separated routing key, or
    /// by the queue name when no key is given.
    pub async fn bind_queue(
        &self,
        addr: &Address,
        exchange: &str,
        queue: &str,
        routing_keys: &str,
    ) -> Result<(), AmqpError> {
        if exchange.is_empty() || queue.is_empty() {
            return Ok(());
        }

        let channel = self.open(addr, None).await?;
        let mut result = Ok(());
        for key in binding_keys(queue, routing_keys) {
            info!(key = key, queue = queue, exchange = exchange, "binding queue");
            if let Err(err) = channel.queue_bind(queue, exchange, key).await {
                result = Err(err);
                break;
            }
        }
        channel.close().await?;
        result
    }

    pub async fn unbind_queue(
        &self,
        addr: &Address,
        exchange: &str,
        queue: &str,
        routing_keys: &str,
    ) -> Result<(), AmqpError> {
        if exchange.is_empty() || queue.is_empty() {
            return Ok(());
        }

        let channel = self.open(addr, None).await?;
        let mut result = Ok(());
        for key in binding_keys(queue, routing_keys) {
            info!(key = key, queue = queue, exchange = exchange, "unbinding queue");
            if let Err(err) = channel.queue_unbind(queue, exchange, key).await {
                result = Err(err);
                break;
            }
        }
        channel.close().await?;
        result
    }

    /// Purges the queue of `addr`. Returns the number of dropped messages.
    pub async fn purge_queue(&self, addr: &Address) -> Result<u32, AmqpError> {
        if addr.queue().is_empty() {
            return Ok(0);
        }

        let channel = self.open(addr, None).await?;
        let purged = channel.queue_purge(addr.queue()).await;
        channel.close().await?;
        purged
    }

    /// Closes every cached connection.
    pub async fn close(&self) {
        let mut connections = self.connections.lock().await;
        for (key, conn) in connections.drain() {
            if let Err(err) = conn.close().await {
                warn!(error = err.to_string(), broker = key.to_string(), "error closing connection");
            }
        }
    }
}

fn binding_keys<'a>(queue: &'a str, routing_keys: &'a str) -> Vec<&'a str> {
    let keys: Vec<&str> = routing_keys.split(' ').filter(|k| !k.is_empty()).collect();
    if keys.is_empty() {
        vec![queue]
    } else {
        keys
    }
}
