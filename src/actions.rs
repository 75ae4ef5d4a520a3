// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish and Subscribe Actions
//!
//! `SubscribeAction` asks the endpoints owning a message type to deliver it
//! here by sending them subscription control messages. `PublishAction` sends a
//! batch to every endpoint subscribed to one of its types.

use crate::{
    address::Address,
    errors::BusError,
    message::{BusMessage, ControlMessage},
    subscriptions::SubscriptionStorage,
    transaction::Transaction,
    transport::Transport,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Owner of every message type whose name starts with `name`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageOwner {
    pub name: String,
    pub endpoint: String,
}

impl MessageOwner {
    pub fn new(name: &str, endpoint: &str) -> MessageOwner {
        MessageOwner {
            name: name.to_owned(),
            endpoint: endpoint.to_owned(),
        }
    }

    pub fn is_owner(&self, type_name: &str) -> bool {
        type_name.starts_with(&self.name)
    }

    pub fn address(&self) -> Result<Address, BusError> {
        Ok(Address::parse(&self.endpoint)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageOwners {
    owners: Vec<MessageOwner>,
}

impl MessageOwners {
    pub fn new(owners: Vec<MessageOwner>) -> MessageOwners {
        MessageOwners { owners }
    }

    pub fn owners_of(&self, type_name: &str) -> Vec<&MessageOwner> {
        self.owners
            .iter()
            .filter(|owner| owner.is_owner(type_name))
            .collect()
    }
}

pub struct SubscribeAction {
    transport: Transport,
    owners: MessageOwners,
}

impl SubscribeAction {
    /// Uses the owners configured on the transport.
    pub fn new(transport: Transport) -> SubscribeAction {
        let owners = MessageOwners::new(transport.config().owners.clone());
        SubscribeAction { transport, owners }
    }

    pub fn with_owners(transport: Transport, owners: MessageOwners) -> SubscribeAction {
        SubscribeAction { transport, owners }
    }

    fn this_endpoint(&self) -> String {
        self.transport.endpoint().to_string()
    }

    /// Asks `owner` to deliver `type_name` messages to this endpoint.
    pub async fn subscribe(&self, type_name: &str, owner: &Address) -> Result<(), BusError> {
        let control = ControlMessage::AddSubscription {
            endpoint: self.this_endpoint(),
            type_name: type_name.to_owned(),
        };
        self.transport.send(owner, vec![control.into()]).await?;
        info!(message_type = type_name, owner = %owner, "subscription requested");
        Ok(())
    }

    pub async fn unsubscribe(&self, type_name: &str, owner: &Address) -> Result<(), BusError> {
        let control = ControlMessage::RemoveSubscription {
            endpoint: self.this_endpoint(),
            type_name: type_name.to_owned(),
        };
        self.transport.send(owner, vec![control.into()]).await?;
        info!(message_type = type_name, owner = %owner, "unsubscription requested");
        Ok(())
    }

    /// Sends an instance subscription for each type to every owner of it.
    ///
    /// # Returns
    /// A subscription error when a type has no owner
    pub async fn subscribe_instance(
        &self,
        type_names: &[&str],
        instance_subscription_key: &str,
    ) -> Result<(), BusError> {
        for type_name in type_names {
            let owners = self.owners.owners_of(type_name);
            if owners.is_empty() {
                return Err(BusError::Subscription(format!(
                    "could not find any owner for message {} that we could subscribe for",
                    type_name
                )));
            }

            for owner in owners {
                let control = ControlMessage::AddInstanceSubscription {
                    endpoint: self.this_endpoint(),
                    type_name: (*type_name).to_owned(),
                    instance_subscription_key: instance_subscription_key.to_owned(),
                };
                debug!(message_type = *type_name, owner = %owner.endpoint, "instance subscription");
                self.transport
                    .send(&owner.address()?, vec![control.into()])
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn unsubscribe_instance(
        &self,
        type_names: &[&str],
        instance_subscription_key: &str,
    ) -> Result<(), BusError> {
        for type_name in type_names {
            for owner in self.owners.owners_of(type_name) {
                let control = ControlMessage::RemoveInstanceSubscription {
                    endpoint: self.this_endpoint(),
                    type_name: (*type_name).to_owned(),
                    instance_subscription_key: instance_subscription_key.to_owned(),
                };
                self.transport
                    .send(&owner.address()?, vec![control.into()])
                    .await?;
            }
        }
        Ok(())
    }
}

pub struct PublishAction {
    transport: Transport,
    subscriptions: Arc<SubscriptionStorage>,
}

impl PublishAction {
    pub fn new(transport: Transport, subscriptions: Arc<SubscriptionStorage>) -> PublishAction {
        PublishAction {
            transport,
            subscriptions,
        }
    }

    /// Sends `messages` to every endpoint subscribed to any of their types.
    ///
    /// # Parameters
    /// * `messages` - The batch, sent as a whole to each subscriber
    /// * `tx` - Unit of work the sends are enlisted in, if any
    ///
    /// # Returns
    /// Whether the batch was sent to at least one subscriber
    pub async fn publish(
        &self,
        messages: Vec<BusMessage>,
        tx: Option<&Transaction>,
    ) -> Result<bool, BusError> {
        if messages.is_empty() {
            return Err(BusError::Publication(
                "cannot publish an empty message batch".to_owned(),
            ));
        }

        let mut destinations: Vec<Address> = vec![];
        for message in &messages {
            for destination in self.subscriptions.get_subscriptions_for(message.type_name()) {
                if !destinations.contains(&destination) {
                    destinations.push(destination);
                }
            }
        }

        for destination in &destinations {
            match tx {
                Some(tx) => self.transport.send_in(tx, destination, messages.clone()).await?,
                None => self.transport.send(destination, messages.clone()).await?,
            };
        }

        debug!(subscribers = destinations.len(), "message published");
        Ok(!destinations.is_empty())
    }
}
