// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Routes application messages to handlers by payload type name. Handlers are
//! registered up front, in order; local instance subscriptions of an attached
//! `SubscriptionStorage` are invoked after them. The dispatcher claims a
//! message iff at least one handler exists for its type, so unhandled types
//! fall through to the transport's discard path.

use crate::{
    errors::{BoxError, BusError},
    module::{MessageContext, MessageModule},
    subscriptions::SubscriptionStorage,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};

/// Processes one message of a delivered batch.
///
/// An error rolls back the whole delivery, which is then retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &MessageContext) -> Result<(), BoxError>;
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
    subscriptions: Option<Arc<SubscriptionStorage>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a message type.
    ///
    /// # Parameters
    /// * `type_name` - Payload type name the handler consumes
    /// * `handler` - Handler to process messages of the specified type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(mut self, type_name: &str, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers
            .entry(type_name.to_owned())
            .or_default()
            .push(handler);
        self
    }

    /// Also dispatches to the local instance subscriptions of `storage`.
    pub fn subscriptions(mut self, storage: Arc<SubscriptionStorage>) -> Self {
        self.subscriptions = Some(storage);
        self
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn handlers_for(&self, type_name: &str) -> Vec<Arc<dyn MessageHandler>> {
        let mut handlers = self.handlers.get(type_name).cloned().unwrap_or_default();
        if let Some(storage) = &self.subscriptions {
            handlers.extend(storage.instance_handlers(type_name));
        }
        handlers
    }
}

#[async_trait]
impl MessageModule for Dispatcher {
    async fn message_arrived(&self, ctx: &MessageContext) -> Result<bool, BusError> {
        let type_name = ctx.message.type_name();
        let handlers = self.handlers_for(type_name);
        if handlers.is_empty() {
            return Ok(false);
        }

        debug!(
            message_type = type_name,
            handlers = handlers.len(),
            "dispatching message"
        );
        for handler in handlers {
            if let Err(err) = handler.handle(ctx).await {
                error!(
                    error = err.to_string(),
                    message_type = type_name,
                    message_id = %ctx.info.transport_message_id,
                    "handler failed"
                );
                return Err(BusError::Processing(err.to_string()));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::Address,
        config::TransportConfig,
        envelope::Envelope,
        broker::{BrokerChannel, Headers},
        memory::MemoryBroker,
        message::BusMessage,
        module::MessageInfo,
        registry::ConnectionRegistry,
        transaction::Transaction,
        transport::TransportBuilder,
    };
    use serde_json::json;

    async fn context(broker: &MemoryBroker, message: BusMessage) -> MessageContext {
        let registry = Arc::new(ConnectionRegistry::new(broker.connector()));
        let transport = TransportBuilder::new(TransportConfig::new("rmq://localhost/orders"))
            .registry(registry.clone())
            .build()
            .unwrap();
        let endpoint = Address::parse("rmq://localhost/orders").unwrap();
        let channel: Arc<dyn BrokerChannel> = registry.open(&endpoint, None).await.unwrap().inner();
        let envelope = Envelope {
            message_id: "m-1".to_owned(),
            data: vec![],
            content_type: None,
            priority: 3,
            reply_to: String::new(),
            headers: Headers::new(),
            expiration: None,
        };

        MessageContext {
            info: MessageInfo::new(&envelope, &endpoint),
            message,
            trace_context: opentelemetry::Context::new(),
            transport,
            transaction: Transaction::new(),
            channel,
        }
    }

    fn order() -> BusMessage {
        BusMessage::new("Order", &json!({ "id": 1 })).unwrap()
    }

    #[tokio::test]
    async fn claims_only_handled_types() {
        let broker = MemoryBroker::new();
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(1).returning(|_| Ok(()));
        let dispatcher = Dispatcher::new().register("Order", Arc::new(handler));

        assert!(dispatcher
            .message_arrived(&context(&broker, order()).await)
            .await
            .unwrap());

        let other = BusMessage::new("Invoice", &json!({})).unwrap();
        assert!(!dispatcher
            .message_arrived(&context(&broker, other).await)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn handler_errors_become_processing_errors() {
        let broker = MemoryBroker::new();
        let mut failing = MockMessageHandler::new();
        failing
            .expect_handle()
            .returning(|_| Err("out of stock".into()));
        let mut skipped = MockMessageHandler::new();
        skipped.expect_handle().never();
        let dispatcher = Dispatcher::new()
            .register("Order", Arc::new(failing))
            .register("Order", Arc::new(skipped));

        let err = dispatcher
            .message_arrived(&context(&broker, order()).await)
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Processing("out of stock".to_owned()));
    }

    #[tokio::test]
    async fn instance_subscriptions_are_dispatched() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new(broker.connector()));
        let storage = Arc::new(SubscriptionStorage::new(
            registry,
            &Address::parse("rmq://localhost/orders").unwrap(),
        ));
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(1).returning(|_| Ok(()));
        let subscription = storage.add_local_instance_subscription(&["Order"], Arc::new(handler));
        let dispatcher = Dispatcher::new().subscriptions(storage.clone());

        assert!(dispatcher
            .message_arrived(&context(&broker, order()).await)
            .await
            .unwrap());

        subscription.close();
        assert!(dispatcher.handlers_for("Order").is_empty());
    }
}
