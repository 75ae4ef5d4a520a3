// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The wire representation of one outgoing batch, and the builder turning a
//! batch of `BusMessage` values into it.

use crate::{
    address::Address,
    broker::{Delivery, HeaderValue, Headers, MessageProperties},
    errors::BusError,
    message::{BusMessage, MessageKind, MessageSerializer, Priority, ADMINISTRATIVE_PRIORITY, MESSAGE_TYPE_HEADER},
    otel,
};
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use uuid::Uuid;

/// One batch of messages as carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: String,
    pub data: Vec<u8>,
    /// Media type of `data`, as named by the serializer that produced it.
    pub content_type: Option<String>,
    /// Broker priority, 0 to 9.
    pub priority: u8,
    pub reply_to: String,
    pub headers: Headers,
    /// Milliseconds before the broker discards the message.
    pub expiration: Option<u64>,
}

impl Envelope {
    pub fn from_delivery(delivery: &Delivery) -> Envelope {
        let props = &delivery.properties;
        Envelope {
            message_id: props.message_id.clone().unwrap_or_default(),
            data: delivery.data.clone(),
            content_type: props.content_type.clone(),
            priority: props.priority.unwrap_or_default(),
            reply_to: props.reply_to.clone().unwrap_or_default(),
            headers: props.headers.clone(),
            expiration: props.expiration.as_ref().and_then(|e| e.parse().ok()),
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_headers(&self.headers)
    }

    /// Transport properties of this envelope. Delivery is always persistent.
    pub fn to_properties(&self) -> MessageProperties {
        MessageProperties {
            message_id: Some(self.message_id.clone()),
            priority: Some(self.priority),
            reply_to: if self.reply_to.is_empty() {
                None
            } else {
                Some(self.reply_to.clone())
            },
            expiration: self.expiration.map(|ms| ms.to_string()),
            headers: self.headers.clone(),
            persistent: true,
            content_type: self.content_type.clone(),
        }
    }
}

/// Everything known about a batch before it becomes an envelope.
#[derive(Debug, Clone)]
pub struct OutgoingMessageInformation {
    pub destination: Option<Address>,
    pub messages: Vec<BusMessage>,
    pub source: Option<Address>,
    pub priority: Priority,
    /// The broker drops the message if it is not consumed by then.
    pub deliver_by: Option<SystemTime>,
    pub headers: Headers,
}

impl OutgoingMessageInformation {
    pub fn new(destination: Address, messages: Vec<BusMessage>) -> OutgoingMessageInformation {
        OutgoingMessageInformation {
            destination: Some(destination),
            messages,
            source: None,
            priority: Priority::default(),
            deliver_by: None,
            headers: Headers::new(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn deliver_by(mut self, deadline: SystemTime) -> Self {
        self.deliver_by = Some(deadline);
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

/// Contributes headers to every outgoing batch.
pub trait CustomizeOutgoingMessages: Send + Sync {
    fn customize(&self, info: &mut OutgoingMessageInformation);
}

type BuiltListener = Arc<dyn Fn(&Envelope) + Send + Sync>;

pub struct MessageBuilder {
    serializer: Arc<dyn MessageSerializer>,
    customizers: Vec<Arc<dyn CustomizeOutgoingMessages>>,
    listeners: Vec<BuiltListener>,
    endpoint: Address,
}

impl MessageBuilder {
    pub fn new(serializer: Arc<dyn MessageSerializer>, endpoint: Address) -> MessageBuilder {
        MessageBuilder {
            serializer,
            customizers: vec![],
            listeners: vec![],
            endpoint,
        }
    }

    pub fn customizer(mut self, customizer: Arc<dyn CustomizeOutgoingMessages>) -> Self {
        self.customizers.push(customizer);
        self
    }

    /// Registers a callback notified after each envelope is built.
    pub fn on_built<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn endpoint(&self) -> &Address {
        &self.endpoint
    }

    pub fn build(&self, info: &mut OutgoingMessageInformation) -> Result<Envelope, BusError> {
        let Some(first) = info.messages.first() else {
            return Err(BusError::Publication("cannot send an empty batch".to_owned()));
        };
        let kind = first.kind();
        let administrative = info.messages.iter().any(BusMessage::is_administrative);

        if info.source.is_none() {
            info.source = Some(self.endpoint.clone());
        }
        for customizer in &self.customizers {
            customizer.customize(info);
        }

        let mut headers = info.headers.clone();
        otel::inject_context(&mut headers);
        headers.insert(MESSAGE_TYPE_HEADER.to_owned(), HeaderValue::Int(kind.code()));

        let envelope = Envelope {
            message_id: Uuid::new_v4().to_string(),
            data: self.serializer.serialize(&info.messages)?,
            content_type: Some(self.serializer.content_type().to_owned()),
            priority: if administrative {
                ADMINISTRATIVE_PRIORITY
            } else {
                info.priority.transport_priority()
            },
            reply_to: self.endpoint.to_string(),
            headers,
            expiration: info.deliver_by.map(remaining_millis),
        };

        for listener in &self.listeners {
            listener(&envelope);
        }

        Ok(envelope)
    }
}

fn remaining_millis(deadline: SystemTime) -> u64 {
    deadline
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
