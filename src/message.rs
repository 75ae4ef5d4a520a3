// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Messages
//!
//! Payload model of the bus. A batch of `BusMessage` values travels in one
//! envelope; control messages that maintain subscriptions form their own
//! variant so that they are matched explicitly rather than by type name.

use crate::{
    broker::{HeaderValue, Headers},
    channel::JSON_CONTENT_TYPE,
    errors::BusError,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Header carrying the `MessageKind` marker.
pub const MESSAGE_TYPE_HEADER: &str = "MessageType";

/// Transport priority of administrative messages.
pub const ADMINISTRATIVE_PRIORITY: u8 = 9;

/// Marker stored in the `MessageType` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageKind {
    #[default]
    Ordinary,
    Administrative,
    LoadBalancer,
    Shutdown,
    Timeout,
}

impl MessageKind {
    pub fn code(&self) -> i64 {
        match self {
            MessageKind::Ordinary => 0,
            MessageKind::Administrative => 1,
            MessageKind::LoadBalancer => 2,
            MessageKind::Shutdown => 3,
            MessageKind::Timeout => 4,
        }
    }

    /// Unknown or missing markers read as ordinary.
    pub fn from_code(code: i64) -> MessageKind {
        match code {
            1 => MessageKind::Administrative,
            2 => MessageKind::LoadBalancer,
            3 => MessageKind::Shutdown,
            4 => MessageKind::Timeout,
            _ => MessageKind::Ordinary,
        }
    }

    pub fn from_headers(headers: &Headers) -> MessageKind {
        headers
            .get(MESSAGE_TYPE_HEADER)
            .and_then(HeaderValue::as_int)
            .map(MessageKind::from_code)
            .unwrap_or_default()
    }
}

/// Logical priority, mapped linearly onto the broker's 0 to 9 scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Lowest,
    VeryLow,
    Low,
    #[default]
    Normal,
    AboveNormal,
    High,
    VeryHigh,
    Highest,
}

impl Priority {
    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn transport_priority(&self) -> u8 {
        self.level() * 9 / 7
    }
}

/// Subscription maintenance messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    AddSubscription {
        endpoint: String,
        type_name: String,
    },
    RemoveSubscription {
        endpoint: String,
        type_name: String,
    },
    AddInstanceSubscription {
        endpoint: String,
        type_name: String,
        instance_subscription_key: String,
    },
    RemoveInstanceSubscription {
        endpoint: String,
        type_name: String,
        instance_subscription_key: String,
    },
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::AddSubscription { .. } => "AddSubscription",
            ControlMessage::RemoveSubscription { .. } => "RemoveSubscription",
            ControlMessage::AddInstanceSubscription { .. } => "AddInstanceSubscription",
            ControlMessage::RemoveInstanceSubscription { .. } => "RemoveInstanceSubscription",
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            ControlMessage::AddSubscription { endpoint, .. }
            | ControlMessage::RemoveSubscription { endpoint, .. }
            | ControlMessage::AddInstanceSubscription { endpoint, .. }
            | ControlMessage::RemoveInstanceSubscription { endpoint, .. } => endpoint,
        }
    }

    /// The subscribed message type.
    pub fn type_name(&self) -> &str {
        match self {
            ControlMessage::AddSubscription { type_name, .. }
            | ControlMessage::RemoveSubscription { type_name, .. }
            | ControlMessage::AddInstanceSubscription { type_name, .. }
            | ControlMessage::RemoveInstanceSubscription { type_name, .. } => type_name,
        }
    }
}

/// An application payload tagged with its type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMessage {
    pub type_name: String,
    pub body: serde_json::Value,
}

impl AppMessage {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BusMessage {
    Administrative(ControlMessage),
    LoadBalancer(AppMessage),
    Application(AppMessage),
}

impl BusMessage {
    /// Wraps a serializable value as an application message.
    pub fn new<T: Serialize>(type_name: &str, body: &T) -> Result<BusMessage, BusError> {
        Ok(BusMessage::Application(AppMessage {
            type_name: type_name.to_owned(),
            body: serde_json::to_value(body)?,
        }))
    }

    pub fn type_name(&self) -> &str {
        match self {
            BusMessage::Administrative(control) => control.name(),
            BusMessage::LoadBalancer(msg) | BusMessage::Application(msg) => &msg.type_name,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            BusMessage::Administrative(_) => MessageKind::Administrative,
            BusMessage::LoadBalancer(_) => MessageKind::LoadBalancer,
            BusMessage::Application(_) => MessageKind::Ordinary,
        }
    }

    pub fn is_administrative(&self) -> bool {
        matches!(self, BusMessage::Administrative(_))
    }
}

impl From<ControlMessage> for BusMessage {
    fn from(control: ControlMessage) -> Self {
        BusMessage::Administrative(control)
    }
}

/// Encodes a batch of messages to bytes and back.
#[cfg_attr(test, mockall::automock)]
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, messages: &[BusMessage]) -> Result<Vec<u8>, BusError>;

    fn deserialize(&self, data: &[u8]) -> Result<Vec<BusMessage>, BusError>;

    /// Media type stamped on every envelope this serializer produces.
    fn content_type(&self) -> &'static str;
}

/// Batches as JSON arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize(&self, messages: &[BusMessage]) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(messages)?)
    }

    fn deserialize(&self, data: &[u8]) -> Result<Vec<BusMessage>, BusError> {
        Ok(serde_json::from_slice(data)?)
    }

    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priorities_span_the_transport_range() {
        assert_eq!(Priority::Lowest.transport_priority(), 0);
        assert_eq!(Priority::Low.transport_priority(), 2);
        assert_eq!(Priority::Normal.transport_priority(), 3);
        assert_eq!(Priority::Highest.transport_priority(), 9);
    }

    #[test]
    fn kind_reads_integer_and_string_markers() {
        let mut headers = Headers::new();
        assert_eq!(MessageKind::from_headers(&headers), MessageKind::Ordinary);

        headers.insert(MESSAGE_TYPE_HEADER.to_owned(), HeaderValue::Int(1));
        assert_eq!(MessageKind::from_headers(&headers), MessageKind::Administrative);

        headers.insert(MESSAGE_TYPE_HEADER.to_owned(), HeaderValue::from("3"));
        assert_eq!(MessageKind::from_headers(&headers), MessageKind::Shutdown);
    }

    #[test]
    fn control_messages_keep_their_wire_shape() {
        let batch = vec![BusMessage::from(ControlMessage::AddSubscription {
            endpoint: "rmq://localhost/billing".to_owned(),
            type_name: "Order".to_owned(),
        })];

        let data = JsonSerializer.serialize(&batch).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();

        assert_eq!(
            value,
            json!([{
                "kind": "administrative",
                "message": {
                    "type": "AddSubscription",
                    "endpoint": "rmq://localhost/billing",
                    "type_name": "Order"
                }
            }])
        );
        assert_eq!(JsonSerializer.deserialize(&data).unwrap(), batch);
    }

    #[test]
    fn application_messages_decode_to_their_type() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Order {
            id: u32,
        }

        let msg = BusMessage::new("Order", &Order { id: 7 }).unwrap();
        assert_eq!(msg.type_name(), "Order");
        assert_eq!(msg.kind(), MessageKind::Ordinary);

        let BusMessage::Application(app) = msg else {
            panic!("expected an application message");
        };
        assert_eq!(app.decode::<Order>().unwrap(), Order { id: 7 });
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(
            JsonSerializer.deserialize(b"not json"),
            Err(BusError::Serialization(_))
        ));
    }
}
