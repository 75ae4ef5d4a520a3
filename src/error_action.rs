// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Action
//!
//! Counts processing failures per transport message id. Once a message has
//! failed `number_of_retries` times, its next arrival is forwarded, intact and
//! annotated with the `error` and `failures` headers, to the endpoint's error
//! queue instead of being dispatched again. Payloads that cannot be decoded are
//! exhausted at once.
//!
//! There is no backoff here: redelivery timing is the broker's requeue.

use crate::{
    broker::HeaderValue,
    errors::BusError,
    module::{MessageInfo, MessageModule},
    transaction::Transaction,
    transport::Transport,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, warn};

/// Header carrying the last failure text of a forwarded message
pub const ERROR_HEADER: &str = "error";
/// Header carrying the number of failed attempts of a forwarded message
pub const FAILURES_HEADER: &str = "failures";

#[derive(Debug, Clone)]
struct ErrorCounter {
    exception_text: Option<String>,
    failure_count: u32,
}

pub struct ErrorAction {
    number_of_retries: u32,
    failure_counts: Mutex<HashMap<String, ErrorCounter>>,
}

impl ErrorAction {
    pub fn new(number_of_retries: u32) -> ErrorAction {
        ErrorAction {
            number_of_retries,
            failure_counts: Mutex::new(HashMap::new()),
        }
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<String, ErrorCounter>> {
        match self.failure_counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn failure_count(&self, message_id: &str) -> Option<u32> {
        self.counts().get(message_id).map(|c| c.failure_count)
    }

    /// Forwards the message to the error queue when its retries are exhausted.
    ///
    /// Returns `true` when the message was forwarded and must not be
    /// processed further. The forward is enlisted in `tx`.
    pub(crate) async fn process(
        &self,
        info: &MessageInfo,
        transport: &Transport,
        tx: &Transaction,
    ) -> Result<bool, BusError> {
        let exhausted = match self.counts().get(&info.transport_message_id) {
            Some(counter) if counter.failure_count >= self.number_of_retries => counter.clone(),
            _ => return Ok(false),
        };

        let mut envelope = info.envelope.clone();
        if let Some(text) = exhausted.exception_text {
            envelope
                .headers
                .insert(ERROR_HEADER.to_owned(), HeaderValue::String(text));
        }
        envelope.headers.insert(
            FAILURES_HEADER.to_owned(),
            HeaderValue::Int(exhausted.failure_count as i64),
        );

        transport.send_to_error_queue(&envelope, Some(tx)).await?;
        self.counts().remove(&info.transport_message_id);

        warn!(
            message_id = %info.transport_message_id,
            failures = exhausted.failure_count,
            "retries exhausted, message moved to the error queue"
        );
        Ok(true)
    }
}

#[async_trait]
impl MessageModule for ErrorAction {
    async fn serialization_exception(&self, info: &MessageInfo, error: &BusError) {
        self.counts().insert(
            info.transport_message_id.clone(),
            ErrorCounter {
                exception_text: Some(error.to_string()),
                failure_count: self.number_of_retries + 1,
            },
        );
    }

    async fn processing_failure(&self, info: &MessageInfo, error: &BusError) {
        let mut counts = self.counts();
        let counter = counts
            .entry(info.transport_message_id.clone())
            .or_insert_with(|| ErrorCounter {
                exception_text: Some(error.to_string()),
                failure_count: 0,
            });
        counter.failure_count += 1;
        debug!(
            message_id = %info.transport_message_id,
            failures = counter.failure_count,
            "message processing failed"
        );
    }

    async fn processing_completed(&self, info: &MessageInfo, error: Option<&BusError>) {
        if error.is_none() {
            self.counts().remove(&info.transport_message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{address::Address, envelope::Envelope, broker::Headers};

    fn info(id: &str) -> MessageInfo {
        let envelope = Envelope {
            message_id: id.to_owned(),
            data: vec![],
            content_type: None,
            priority: 3,
            reply_to: String::new(),
            headers: Headers::new(),
            expiration: None,
        };
        MessageInfo::new(&envelope, &Address::parse("rmq://localhost/orders").unwrap())
    }

    #[tokio::test]
    async fn failures_accumulate_until_success() {
        let action = ErrorAction::new(3);
        let failure = BusError::Processing("boom".to_owned());

        action.processing_failure(&info("a"), &failure).await;
        action.processing_failure(&info("a"), &failure).await;
        assert_eq!(action.failure_count("a"), Some(2));

        action.processing_completed(&info("a"), Some(&failure)).await;
        assert_eq!(action.failure_count("a"), Some(2));

        action.processing_completed(&info("a"), None).await;
        assert_eq!(action.failure_count("a"), None);
    }

    #[tokio::test]
    async fn serialization_failures_exhaust_at_once() {
        let action = ErrorAction::new(3);
        action
            .serialization_exception(&info("a"), &BusError::Serialization("eof".to_owned()))
            .await;

        assert_eq!(action.failure_count("a"), Some(4));
    }

    #[tokio::test]
    async fn counters_are_per_message() {
        let action = ErrorAction::new(3);
        let failure = BusError::Processing("boom".to_owned());

        action.processing_failure(&info("a"), &failure).await;
        action.processing_failure(&info("b"), &failure).await;
        action.processing_completed(&info("b"), None).await;

        assert_eq!(action.failure_count("a"), Some(1));
        assert_eq!(action.failure_count("b"), None);
    }
}
