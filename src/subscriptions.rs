// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Storage
//!
//! Keeps the type → destination directory of an endpoint.
//!
//! Durable subscriptions arrive as `AddSubscription` / `RemoveSubscription`
//! control messages. Applying an `AddSubscription` binds the subscriber's
//! queue to this endpoint's exchange with the type name, records it in memory
//! and, unless a retained record of it is known to exist, republishes the
//! control message to the endpoint's `subscriptions` sub-queue within the
//! delivery's unit of work. The record counts as retained once that unit of
//! work commits. At start the storage reads the queue back, replays every
//! record through the same path, and returns the records to the queue.
//!
//! Remote instance subscriptions live in memory only. Local instance
//! subscriptions register a handler and hand back an `InstanceSubscription`
//! whose `close` (or drop) removes it.

use crate::{
    address::{Address, SubQueue},
    dispatcher::MessageHandler,
    errors::BusError,
    message::{BusMessage, ControlMessage, MessageSerializer},
    module::{MessageContext, MessageModule},
    registry::ConnectionRegistry,
    transaction::Transaction,
    transport::Transport,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
};
use tracing::{debug, error, info, warn};

type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// (type, subscriber) pairs with a committed record in the subscription queue.
type Retained = Arc<Mutex<HashSet<(String, Address)>>>;

#[derive(Default)]
struct Directory {
    durable: HashMap<String, Vec<Address>>,
    /// type → instance subscription key → subscriber
    remote_instances: HashMap<String, HashMap<String, Address>>,
    /// type → (handle id, handler)
    local_instances: HashMap<String, Vec<(u64, Arc<dyn MessageHandler>)>>,
}

pub struct SubscriptionStorage {
    registry: Arc<ConnectionRegistry>,
    endpoint: Address,
    subscription_queue: Address,
    directory: RwLock<Directory>,
    retained: Retained,
    listeners: RwLock<Vec<ChangeListener>>,
    next_handle: AtomicU64,
}

impl SubscriptionStorage {
    pub fn new(registry: Arc<ConnectionRegistry>, endpoint: &Address) -> SubscriptionStorage {
        SubscriptionStorage {
            registry,
            endpoint: endpoint.clone(),
            subscription_queue: endpoint.for_sub_queue(SubQueue::Subscriptions),
            directory: RwLock::new(Directory::default()),
            retained: Arc::new(Mutex::new(HashSet::new())),
            listeners: RwLock::new(vec![]),
            next_handle: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Directory> {
        match self.directory.read() {
            Ok(directory) => directory,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Directory> {
        match self.directory.write() {
            Ok(directory) => directory,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a callback fired after every change of the directory.
    pub fn on_subscription_changed<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(Arc::new(listener)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(listener)),
        }
    }

    fn retained(&self) -> std::sync::MutexGuard<'_, HashSet<(String, Address)>> {
        match self.retained.lock() {
            Ok(retained) => retained,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn subscription_changed(&self) {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener();
        }
    }

    /// Destinations subscribed to exactly `type_name`, durable and instance.
    pub fn get_subscriptions_for(&self, type_name: &str) -> Vec<Address> {
        let directory = self.read();
        let mut destinations: Vec<Address> = vec![];

        let durable = directory.durable.get(type_name).into_iter().flatten();
        let instances = directory
            .remote_instances
            .get(type_name)
            .into_iter()
            .flat_map(|by_key| by_key.values());
        for destination in durable.chain(instances) {
            if !destinations.contains(destination) {
                destinations.push(destination.clone());
            }
        }
        destinations
    }

    /// Handlers of the live local instance subscriptions to `type_name`.
    pub fn instance_handlers(&self, type_name: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.read()
            .local_instances
            .get(type_name)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Records a durable subscription. Returns false when it already existed.
    pub fn add_subscription(&self, type_name: &str, endpoint: &Address) -> bool {
        let added = {
            let mut directory = self.write();
            let destinations = directory.durable.entry(type_name.to_owned()).or_default();
            if destinations.contains(endpoint) {
                false
            } else {
                destinations.push(endpoint.clone());
                true
            }
        };
        self.subscription_changed();
        added
    }

    pub fn remove_subscription(&self, type_name: &str, endpoint: &Address) {
        {
            let mut directory = self.write();
            if let Some(destinations) = directory.durable.get_mut(type_name) {
                destinations.retain(|d| d != endpoint);
                if destinations.is_empty() {
                    directory.durable.remove(type_name);
                }
            }
        }
        self.subscription_changed();
    }

    pub fn add_instance_subscription(&self, type_name: &str, key: &str, endpoint: &Address) {
        self.write()
            .remote_instances
            .entry(type_name.to_owned())
            .or_default()
            .insert(key.to_owned(), endpoint.clone());
        self.subscription_changed();
    }

    pub fn remove_instance_subscription(&self, type_name: &str, key: &str) {
        {
            let mut directory = self.write();
            if let Some(by_key) = directory.remote_instances.get_mut(type_name) {
                by_key.remove(key);
                if by_key.is_empty() {
                    directory.remote_instances.remove(type_name);
                }
            }
        }
        self.subscription_changed();
    }

    /// Subscribes `handler`, in process, to every type of `type_names`.
    ///
    /// The subscription lasts until the returned handle is closed or dropped.
    pub fn add_local_instance_subscription(
        self: &Arc<Self>,
        type_names: &[&str],
        handler: Arc<dyn MessageHandler>,
    ) -> InstanceSubscription {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        {
            let mut directory = self.write();
            for type_name in type_names {
                directory
                    .local_instances
                    .entry((*type_name).to_owned())
                    .or_default()
                    .push((id, handler.clone()));
            }
        }
        self.subscription_changed();

        InstanceSubscription {
            id,
            type_names: type_names.iter().map(|t| (*t).to_owned()).collect(),
            storage: Arc::downgrade(self),
        }
    }

    fn remove_local_instance_subscription(&self, id: u64, type_names: &[String]) {
        let removed = {
            let mut directory = self.write();
            let mut removed = false;
            for type_name in type_names {
                if let Some(handlers) = directory.local_instances.get_mut(type_name) {
                    let before = handlers.len();
                    handlers.retain(|(handle, _)| *handle != id);
                    removed |= handlers.len() != before;
                    if handlers.is_empty() {
                        directory.local_instances.remove(type_name);
                    }
                }
            }
            removed
        };
        if removed {
            self.subscription_changed();
        }
    }

    /// Rebuilds the directory from the retained records of the subscription
    /// queue. Records are returned to the queue afterwards.
    ///
    /// # Returns
    /// A subscription error when a record cannot be decoded or applied
    pub async fn initialize(&self, transport: &Transport) -> Result<(), BusError> {
        let tx = Transaction::new();
        let replayed = self.replay(transport, &tx).await;
        tx.dispose().await?;

        match replayed {
            Ok(count) => {
                info!(
                    queue = self.subscription_queue.queue(),
                    records = count,
                    "subscriptions restored"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "corrupt subscription queue");
                Err(err)
            }
        }
    }

    async fn replay(&self, transport: &Transport, tx: &Transaction) -> Result<usize, BusError> {
        let mut records = transport
            .read_messages(Some(SubQueue::Subscriptions), tx)
            .await?;
        let mut count = 0;

        while let Some(record) = records.next().await {
            let envelope = record?;
            let messages = transport
                .serializer()
                .deserialize(&envelope.data)
                .map_err(|err| {
                    BusError::Subscription(format!(
                        "malformed subscription record {}: {}",
                        envelope.message_id, err
                    ))
                })?;

            for message in messages {
                let BusMessage::Administrative(control) = message else {
                    return Err(BusError::Subscription(format!(
                        "unexpected `{}` in subscription record {}",
                        message.type_name(),
                        envelope.message_id
                    )));
                };
                self.apply(&control, None).await?;
                count += 1;
            }
        }

        Ok(count)
    }

    /// Applies a control message. `live` is the delivery it arrived with,
    /// absent during replay.
    async fn apply(
        &self,
        control: &ControlMessage,
        live: Option<&MessageContext>,
    ) -> Result<(), BusError> {
        let subscriber = Address::parse(control.endpoint()).map_err(|err| {
            BusError::Subscription(format!(
                "invalid subscriber `{}` in {}: {}",
                control.endpoint(),
                control.name(),
                err
            ))
        })?;
        let type_name = control.type_name();

        match control {
            ControlMessage::AddSubscription { .. } => {
                self.registry
                    .bind_queue(
                        &self.endpoint,
                        self.endpoint.exchange(),
                        subscriber.queue(),
                        type_name,
                    )
                    .await
                    .map_err(|err| BusError::Subscription(err.to_string()))?;

                let added = self.add_subscription(type_name, &subscriber);
                info!(
                    message_type = type_name,
                    subscriber = %subscriber,
                    new = added,
                    "subscription added"
                );

                let key = (type_name.to_owned(), subscriber.clone());
                match live {
                    None => {
                        self.retained().insert(key);
                    }
                    Some(ctx) if !self.retained().contains(&key) => {
                        ctx.send(&self.subscription_queue, vec![BusMessage::from(control.clone())])
                            .await?;
                        let retained = self.retained.clone();
                        ctx.transaction().enlist_settlement(move |committed| async move {
                            if committed {
                                match retained.lock() {
                                    Ok(mut retained) => retained.insert(key),
                                    Err(poisoned) => poisoned.into_inner().insert(key),
                                };
                            }
                            Ok::<(), BusError>(())
                        });
                    }
                    Some(_) => {}
                }
            }
            ControlMessage::RemoveSubscription { .. } => {
                self.registry
                    .unbind_queue(
                        &self.endpoint,
                        self.endpoint.exchange(),
                        subscriber.queue(),
                        type_name,
                    )
                    .await
                    .map_err(|err| BusError::Subscription(err.to_string()))?;

                self.remove_subscription(type_name, &subscriber);
                info!(
                    message_type = type_name,
                    subscriber = %subscriber,
                    "subscription removed"
                );

                self.retained()
                    .remove(&(type_name.to_owned(), subscriber.clone()));
                if let Some(ctx) = live {
                    self.forget(type_name, &subscriber, ctx.transport().serializer().as_ref())
                        .await?;
                }
            }
            ControlMessage::AddInstanceSubscription {
                instance_subscription_key,
                ..
            } => {
                self.add_instance_subscription(type_name, instance_subscription_key, &subscriber);
                debug!(
                    message_type = type_name,
                    key = %instance_subscription_key,
                    "instance subscription added"
                );
            }
            ControlMessage::RemoveInstanceSubscription {
                instance_subscription_key,
                ..
            } => {
                self.remove_instance_subscription(type_name, instance_subscription_key);
                debug!(
                    message_type = type_name,
                    key = %instance_subscription_key,
                    "instance subscription removed"
                );
            }
        }

        Ok(())
    }

    /// Deletes the retained records of a durable subscription.
    async fn forget(
        &self,
        type_name: &str,
        subscriber: &Address,
        serializer: &dyn MessageSerializer,
    ) -> Result<(), BusError> {
        let channel = self.registry.open(&self.subscription_queue, None).await?;
        let queue = self.subscription_queue.queue();
        let mut kept = vec![];
        let mut deleted = 0;

        let outcome: Result<(), BusError> = async {
            while let Some(delivery) = channel.basic_get(queue).await? {
                if retains(serializer, &delivery.data, type_name, subscriber) {
                    channel.basic_ack(delivery.delivery_tag).await?;
                    deleted += 1;
                } else {
                    kept.push(delivery.delivery_tag);
                }
            }
            for tag in &kept {
                channel.basic_nack(*tag, true).await?;
            }
            Ok::<(), BusError>(())
        }
        .await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "error closing subscription channel");
        }
        debug!(message_type = type_name, deleted, "retained subscription records deleted");
        outcome
    }
}

/// Whether a retained record is the `AddSubscription` of `type_name` by
/// `subscriber`.
fn retains(
    serializer: &dyn MessageSerializer,
    data: &[u8],
    type_name: &str,
    subscriber: &Address,
) -> bool {
    let Ok(messages) = serializer.deserialize(data) else {
        return false;
    };
    messages.iter().any(|message| match message {
        BusMessage::Administrative(ControlMessage::AddSubscription {
            endpoint,
            type_name: record_type,
        }) => {
            record_type == type_name
                && Address::parse(endpoint).is_ok_and(|record| &record == subscriber)
        }
        _ => false,
    })
}

#[async_trait]
impl MessageModule for SubscriptionStorage {
    async fn started(&self, transport: &Transport) -> Result<(), BusError> {
        self.initialize(transport).await
    }

    async fn administrative_message_arrived(&self, ctx: &MessageContext) -> Result<bool, BusError> {
        let BusMessage::Administrative(control) = &ctx.message else {
            return Ok(false);
        };
        self.apply(control, Some(ctx)).await?;
        Ok(true)
    }
}

/// Handle of a local instance subscription. Closing or dropping it removes
/// the subscription.
pub struct InstanceSubscription {
    id: u64,
    type_names: Vec<String>,
    storage: Weak<SubscriptionStorage>,
}

impl InstanceSubscription {
    pub fn type_names(&self) -> &[String] {
        &self.type_names
    }

    pub fn close(self) {}
}

impl Drop for InstanceSubscription {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.upgrade() {
            storage.remove_local_instance_subscription(self.id, &self.type_names);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::MockMessageHandler, memory::MemoryBroker, message::MockMessageSerializer,
    };
    use std::sync::atomic::AtomicUsize;

    fn storage(broker: &MemoryBroker) -> Arc<SubscriptionStorage> {
        let registry = Arc::new(ConnectionRegistry::new(broker.connector()));
        Arc::new(SubscriptionStorage::new(
            registry,
            &Address::parse("rmq://localhost/orders#orders").unwrap(),
        ))
    }

    fn billing() -> Address {
        Address::parse("rmq://localhost/billing").unwrap()
    }

    fn counter(storage: &SubscriptionStorage) -> Arc<AtomicUsize> {
        let changes = Arc::new(AtomicUsize::new(0));
        let counted = changes.clone();
        storage.on_subscription_changed(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        changes
    }

    #[test]
    fn durable_subscriptions_are_deduplicated() {
        let storage = storage(&MemoryBroker::new());
        let changes = counter(&storage);

        assert!(storage.add_subscription("Order", &billing()));
        assert!(!storage.add_subscription("Order", &billing()));

        assert_eq!(storage.get_subscriptions_for("Order"), vec![billing()]);
        assert_eq!(changes.load(Ordering::SeqCst), 2);

        storage.remove_subscription("Order", &billing());
        assert!(storage.get_subscriptions_for("Order").is_empty());
    }

    #[test]
    fn instance_subscriptions_join_durable_ones() {
        let storage = storage(&MemoryBroker::new());
        let shipping = Address::parse("rmq://localhost/shipping").unwrap();

        storage.add_subscription("Order", &billing());
        storage.add_instance_subscription("Order", "k1", &shipping);
        storage.add_instance_subscription("Order", "k2", &billing());

        let destinations = storage.get_subscriptions_for("Order");
        assert_eq!(destinations.len(), 2);
        assert!(destinations.contains(&shipping));

        storage.remove_instance_subscription("Order", "k1");
        assert_eq!(storage.get_subscriptions_for("Order"), vec![billing()]);
        assert!(storage.get_subscriptions_for("Invoice").is_empty());
    }

    #[test]
    fn dropping_the_handle_removes_a_local_subscription() {
        let storage = storage(&MemoryBroker::new());
        let changes = counter(&storage);

        let handle = storage
            .add_local_instance_subscription(&["Order", "Invoice"], Arc::new(MockMessageHandler::new()));
        assert_eq!(storage.instance_handlers("Order").len(), 1);
        assert_eq!(storage.instance_handlers("Invoice").len(), 1);

        drop(handle);
        assert!(storage.instance_handlers("Order").is_empty());
        assert!(storage.instance_handlers("Invoice").is_empty());
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retained_records_match_type_and_subscriber() {
        let mut serializer = MockMessageSerializer::new();
        serializer.expect_deserialize().returning(|data| match data {
            b"record" => Ok(vec![BusMessage::from(ControlMessage::AddSubscription {
                endpoint: "rmq://localhost/billing".to_owned(),
                type_name: "Order".to_owned(),
            })]),
            _ => Err(BusError::Serialization("unreadable".to_owned())),
        });

        assert!(retains(&serializer, b"record", "Order", &billing()));
        assert!(!retains(&serializer, b"record", "Invoice", &billing()));
        assert!(!retains(&serializer, b"other", "Order", &billing()));
    }
}
