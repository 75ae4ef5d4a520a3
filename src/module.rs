// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Lifecycle Hooks
//!
//! Components plug into the transport by implementing `MessageModule`. Modules
//! run in registration order. For the two `*_arrived` hooks the first module
//! returning `Ok(true)` claims the message and the remaining ones are skipped;
//! every other hook runs on every module.

use crate::{
    address::Address,
    broker::{BrokerChannel, Headers},
    envelope::Envelope,
    errors::BusError,
    message::BusMessage,
    transaction::Transaction,
    transport::Transport,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;

/// What the transport knows about a message outside of handler dispatch.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub transport_message_id: String,
    /// Endpoint the message came from, read from its reply-to.
    pub source: Option<Address>,
    pub destination: Address,
    pub headers: Headers,
    pub envelope: Envelope,
    /// The decoded batch. Empty when the payload could not be decoded.
    pub messages: Vec<BusMessage>,
}

impl MessageInfo {
    pub(crate) fn new(envelope: &Envelope, destination: &Address) -> MessageInfo {
        MessageInfo {
            transport_message_id: envelope.message_id.clone(),
            source: Address::parse(&envelope.reply_to).ok(),
            destination: destination.clone(),
            headers: envelope.headers.clone(),
            envelope: envelope.clone(),
            messages: vec![],
        }
    }
}

/// Scope of one message of a delivered batch.
#[derive(Clone)]
pub struct MessageContext {
    pub info: MessageInfo,
    pub message: BusMessage,
    /// Trace context extracted from the delivery headers.
    pub trace_context: Context,
    pub(crate) transport: Transport,
    pub(crate) transaction: Transaction,
    pub(crate) channel: Arc<dyn BrokerChannel>,
}

impl MessageContext {
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The unit of work of the delivery.
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Channel the delivery arrived on.
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    pub fn all_messages(&self) -> &[BusMessage] {
        &self.info.messages
    }

    /// Sends within the delivery's unit of work: published only if it commits.
    pub async fn send(
        &self,
        destination: &Address,
        messages: Vec<BusMessage>,
    ) -> Result<String, BusError> {
        self.transport
            .send_in(&self.transaction, destination, messages)
            .await
    }

    /// Sends back to the source of the delivery.
    pub async fn reply(&self, messages: Vec<BusMessage>) -> Result<String, BusError> {
        let Some(source) = self.info.source.as_ref() else {
            return Err(BusError::Transport(format!(
                "message {} has no reply address",
                self.info.transport_message_id
            )));
        };
        self.send(source, messages).await
    }
}

#[async_trait]
pub trait MessageModule: Send + Sync {
    /// Called once the transport is started, before consuming begins. An
    /// error aborts the start.
    async fn started(&self, _transport: &Transport) -> Result<(), BusError> {
        Ok(())
    }

    async fn message_arrived(&self, _ctx: &MessageContext) -> Result<bool, BusError> {
        Ok(false)
    }

    async fn administrative_message_arrived(
        &self,
        _ctx: &MessageContext,
    ) -> Result<bool, BusError> {
        Ok(false)
    }

    async fn message_sent(&self, _info: &MessageInfo) {}

    async fn serialization_exception(&self, _info: &MessageInfo, _error: &BusError) {}

    async fn processing_failure(&self, _info: &MessageInfo, _error: &BusError) {}

    async fn processing_completed(&self, _info: &MessageInfo, _error: Option<&BusError>) {}

    async fn administrative_processing_completed(
        &self,
        _info: &MessageInfo,
        _error: Option<&BusError>,
    ) {
    }

    async fn before_commit(&self, _info: &MessageInfo) {}

    async fn before_rollback(&self, _info: &MessageInfo) {}
}
