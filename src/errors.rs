// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Service Bus
//!
//! Two layers of errors live here. `AmqpError` describes failures of a single
//! broker operation (connect, declare, publish, ack...). `BusError` is the
//! taxonomy surfaced by the bus itself: malformed addresses, transport setup
//! failures, payload decode failures, subscription failures and handler
//! failures.

use thiserror::Error;

/// Boxed error returned by message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the broker operation that failed. The payload carries the
/// resource name or the client library's message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The channel or its connection is already closed
    #[error("channel closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error removing a binding between an exchange and a queue
    #[error("failure to unbind exchange `{0}` from queue `{1}`")]
    UnbindingExchangeFromQueueError(String, String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error pulling a message with basic.get
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error switching a channel to transactional mode
    #[error("failure to select tx mode")]
    TxSelectError,

    /// Error committing a channel transaction
    #[error("failure to commit channel transaction")]
    TxCommitError,

    /// Error rolling back a channel transaction
    #[error("failure to rollback channel transaction")]
    TxRollbackError,
}

/// Errors raised while parsing or building an endpoint address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid endpoint uri `{0}`")]
    InvalidUri(String),

    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),

    /// An address must name an exchange, a queue or routing keys.
    #[error("no exchange, queue, or routing keys defined for endpoint `{0}`")]
    Underspecified(String),

    #[error("cannot specify route by type or routing keys without an exchange `{0}`")]
    MissingExchange(String),

    #[error("invalid value `{1}` for `{0}`")]
    InvalidParameter(String, String),
}

/// Errors raised by the ambient transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("a transaction is already active for this unit of work")]
    AlreadyActive,

    #[error("transaction is already disposed, cannot dispose twice")]
    AlreadyDisposed,

    #[error("transaction was rolled back")]
    RolledBack,
}

/// Errors surfaced by the service bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Amqp(#[from] AmqpError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Channel or queue setup failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("cannot send a message before the transport is started")]
    NotStarted,

    /// Payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    /// A message handler failed.
    #[error("processing error: {0}")]
    Processing(String),

    #[error("publication error: {0}")]
    Publication(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}
