// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Endpoint Topology
//!
//! The broker objects one endpoint needs: its queue (bound to its exchange
//! when it has one), the `subscriptions`, `errors` and `discarded` sub-queues
//! derived from it, and optionally the delayed-message exchange used for
//! deferred sends. `install` is idempotent and safe on every start.

use crate::{
    address::{Address, SubQueue},
    errors::{AmqpError, BusError},
    exchange::ExchangeKind,
    registry::ConnectionRegistry,
};
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct EndpointTopology {
    endpoint: Address,
    subscriptions: Address,
    errors: Address,
    discarded: Address,
    delay_exchange: Option<String>,
}

impl EndpointTopology {
    pub fn new(endpoint: &Address) -> EndpointTopology {
        EndpointTopology {
            endpoint: endpoint.clone(),
            subscriptions: endpoint.for_sub_queue(SubQueue::Subscriptions),
            errors: endpoint.for_sub_queue(SubQueue::Errors),
            discarded: endpoint.for_sub_queue(SubQueue::Discarded),
            delay_exchange: None,
        }
    }

    /// Declares `name` as a delayed-message exchange routing to the endpoint
    /// queue by queue name.
    pub fn delay_exchange(mut self, name: &str) -> Self {
        if !name.is_empty() {
            self.delay_exchange = Some(name.to_owned());
        }
        self
    }

    pub fn endpoint(&self) -> &Address {
        &self.endpoint
    }

    pub fn subscription_queue(&self) -> &Address {
        &self.subscriptions
    }

    pub fn error_queue(&self) -> &Address {
        &self.errors
    }

    pub fn discarded_queue(&self) -> &Address {
        &self.discarded
    }

    pub fn delayed_exchange(&self) -> Option<&str> {
        self.delay_exchange.as_deref()
    }

    pub fn sub_queue(&self, kind: SubQueue) -> &Address {
        match kind {
            SubQueue::Subscriptions => &self.subscriptions,
            SubQueue::Errors => &self.errors,
            SubQueue::Discarded => &self.discarded,
        }
    }

    fn queues(&self) -> [&Address; 4] {
        [
            &self.endpoint,
            &self.subscriptions,
            &self.errors,
            &self.discarded,
        ]
    }

    /// Installs the topology on the broker.
    ///
    /// # Returns
    /// Ok(()) on success or a transport error naming the endpoint
    pub async fn install(&self, registry: &ConnectionRegistry) -> Result<(), BusError> {
        self.try_install(registry).await.map_err(|err| {
            error!(error = err.to_string(), endpoint = %self.endpoint, "error installing topology");
            BusError::Transport(format!("could not open queue {}: {}", self.endpoint, err))
        })
    }

    async fn try_install(&self, registry: &ConnectionRegistry) -> Result<(), AmqpError> {
        let endpoint = &self.endpoint;

        for queue in self.queues() {
            registry.declare_queue(queue, queue.queue()).await?;
        }

        registry
            .declare_exchange(endpoint, endpoint.exchange(), ExchangeKind::Direct)
            .await?;
        registry
            .bind_queue(
                endpoint,
                endpoint.exchange(),
                endpoint.queue(),
                endpoint.routing_keys(),
            )
            .await?;

        if let Some(delay_exchange) = &self.delay_exchange {
            registry
                .declare_exchange(endpoint, delay_exchange, ExchangeKind::XMessageDelayed)
                .await?;
            registry
                .bind_queue(endpoint, delay_exchange, endpoint.queue(), "")
                .await?;
        }

        debug!(endpoint = %endpoint, "topology installed");
        Ok(())
    }

    /// Empties the endpoint queue and every sub-queue.
    pub async fn purge_all(&self, registry: &ConnectionRegistry) -> Result<(), BusError> {
        for queue in self.queues() {
            let purged = registry.purge_queue(queue).await?;
            debug!(queue = queue.queue(), purged = purged, "queue purged");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{BrokerConnection, Connector, MessageProperties, MockConnector},
        memory::MemoryBroker,
    };
    use std::sync::Arc;

    #[test]
    fn derives_sub_queues() {
        let endpoint = Address::parse("rmq://localhost/orders#orders-ex").unwrap();
        let topology = EndpointTopology::new(&endpoint);

        assert_eq!(topology.subscription_queue().queue(), "orders.subscriptions");
        assert_eq!(topology.error_queue().queue(), "orders.errors");
        assert_eq!(topology.discarded_queue().queue(), "orders.discarded");
        assert_eq!(topology.error_queue().exchange(), "");
    }

    #[tokio::test]
    async fn installs_queues_exchanges_and_bindings() {
        let broker = MemoryBroker::new();
        let registry = ConnectionRegistry::new(broker.connector());
        let endpoint = Address::parse("rmq://localhost/orders#orders-ex").unwrap();
        let topology = EndpointTopology::new(&endpoint).delay_exchange("delayed");

        topology.install(&registry).await.unwrap();
        topology.install(&registry).await.unwrap();

        for queue in ["orders", "orders.subscriptions", "orders.errors", "orders.discarded"] {
            assert!(broker.has_queue(queue), "missing {}", queue);
        }
        assert_eq!(broker.exchange_kind("orders-ex"), Some(ExchangeKind::Direct));
        assert_eq!(
            broker.exchange_kind("delayed"),
            Some(ExchangeKind::XMessageDelayed)
        );

        let mut exchanges: Vec<String> = broker
            .bindings("orders")
            .into_iter()
            .map(|b| format!("{}:{}", b.exchange, b.routing_key))
            .collect();
        exchanges.sort();
        assert_eq!(exchanges, vec!["delayed:orders", "orders-ex:orders"]);
    }

    #[tokio::test]
    async fn install_failures_are_transport_errors() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|_, _| Err(AmqpError::ConnectionError("refused".to_owned())));
        let registry = ConnectionRegistry::new(Arc::new(connector));
        let topology = EndpointTopology::new(&Address::parse("rmq://localhost/orders").unwrap());

        let err = topology.install(&registry).await.unwrap_err();
        assert!(matches!(err, BusError::Transport(msg) if msg.starts_with("could not open queue")));
    }

    #[tokio::test]
    async fn purge_all_empties_every_queue() {
        let broker = MemoryBroker::new();
        let registry = ConnectionRegistry::new(broker.connector());
        let endpoint = Address::parse("rmq://localhost/orders").unwrap();
        let topology = EndpointTopology::new(&endpoint);
        topology.install(&registry).await.unwrap();

        let conn = broker
            .connector()
            .connect(&registry.connection_key(&endpoint), endpoint.tls())
            .await
            .unwrap();
        let channel = conn.create_channel().await.unwrap();
        for queue in ["orders", "orders.errors"] {
            channel
                .basic_publish("", queue, b"x", &MessageProperties::default())
                .await
                .unwrap();
        }

        topology.purge_all(&registry).await.unwrap();
        assert_eq!(broker.queue_len("orders"), 0);
        assert_eq!(broker.queue_len("orders.errors"), 0);
    }
}
