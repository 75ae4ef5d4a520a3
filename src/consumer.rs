// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Endpoint Consumer
//!
//! Subscribes to the endpoint queue and hands each delivery to a callback,
//! with at most `concurrency` deliveries in flight. The broker prefetch is set
//! to the same bound; a delivery arriving while every slot is taken waits for
//! one to free before its callback runs.
//!
//! Stopping cancels the subscription, waits (bounded by the drain timeout) for
//! in-flight deliveries to finish, then closes the channel. A callback that
//! never returns holds its slot forever; no per-message timeout is enforced.

use crate::{
    address::Address,
    broker::{BrokerChannel, Delivery},
    errors::BusError,
    registry::ConnectionRegistry,
};
use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Semaphore, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Callback invoked for each delivery with the channel it arrived on.
pub type DeliveryCallback =
    Arc<dyn Fn(Arc<dyn BrokerChannel>, Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Consumer {
    registry: Arc<ConnectionRegistry>,
    address: Address,
    concurrency: usize,
    drain_timeout: Duration,
    consumer_tag: String,
    channel: Option<Arc<dyn BrokerChannel>>,
    task: Option<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl Consumer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        address: Address,
        concurrency: usize,
        drain_timeout: Duration,
    ) -> Consumer {
        Consumer {
            registry,
            address,
            concurrency,
            drain_timeout,
            consumer_tag: format!("rabbitbus-{}", Uuid::new_v4()),
            channel: None,
            task: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_consuming(&self) -> bool {
        self.task.is_some()
    }

    /// Starts consuming. A concurrency of zero leaves the endpoint send-only.
    ///
    /// # Parameters
    /// * `callback` - Invoked once per delivery; panics are caught and logged
    ///
    /// # Returns
    /// Ok(()) once the subscription is registered on the broker
    pub async fn start(&mut self, callback: DeliveryCallback) -> Result<(), BusError> {
        if self.concurrency == 0 {
            info!(queue = self.address.queue(), "concurrency is zero, not consuming");
            return Ok(());
        }
        if self.task.is_some() {
            return Ok(());
        }

        let channel = self.registry.open(&self.address, None).await?.inner();
        let prefetch = u16::try_from(self.concurrency).unwrap_or(u16::MAX);
        channel.basic_qos(prefetch).await?;
        let mut deliveries = channel
            .basic_consume(self.address.queue(), &self.consumer_tag)
            .await?;

        let slots = Arc::new(Semaphore::new(self.concurrency));
        let in_flight = self.in_flight.clone();
        let consuming = channel.clone();
        let queue = self.address.queue().to_owned();

        self.task = Some(tokio::spawn(async move {
            while let Some(result) = deliveries.next().await {
                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(error = err.to_string(), queue = %queue, "errors consume msg");
                        break;
                    }
                };

                let Ok(permit) = slots.clone().acquire_owned().await else {
                    break;
                };
                in_flight.fetch_add(1, Ordering::SeqCst);

                let callback = callback.clone();
                let channel = consuming.clone();
                let channel_for_reject = consuming.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    let tag = delivery.delivery_tag;
                    let outcome = AssertUnwindSafe(callback(channel, delivery))
                        .catch_unwind()
                        .await;
                    if outcome.is_err() {
                        error!(delivery_tag = tag, "delivery callback panicked, rejecting");
                        if let Err(err) = channel_for_reject.basic_nack(tag, false).await {
                            warn!(error = err.to_string(), delivery_tag = tag, "could not reject delivery");
                        }
                    }
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }
            debug!(queue = %queue, "consumer stream ended");
        }));
        self.channel = Some(channel);

        info!(
            queue = self.address.queue(),
            concurrency = self.concurrency,
            "consumer started"
        );
        Ok(())
    }

    /// Cancels the subscription and drains in-flight deliveries.
    pub async fn stop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };

        if let Err(err) = channel.basic_cancel(&self.consumer_tag).await {
            warn!(error = err.to_string(), "error cancelling consumer");
        }

        let deadline = Instant::now() + self.drain_timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.in_flight(),
                    "drain timeout expired, stopping with deliveries in flight"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "error closing consumer channel");
        }
        info!(queue = self.address.queue(), "consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MessageProperties, memory::MemoryBroker};
    use std::sync::Mutex;

    async fn setup(concurrency: usize) -> (MemoryBroker, Consumer) {
        let broker = MemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new(broker.connector()));
        let address = Address::parse("rmq://localhost/orders").unwrap();
        registry.declare_queue(&address, "orders").await.unwrap();
        let consumer = Consumer::new(registry, address, concurrency, Duration::from_secs(5));
        (broker, consumer)
    }

    async fn publish(broker: &MemoryBroker, body: &[u8]) {
        let registry = ConnectionRegistry::new(broker.connector());
        let channel = registry
            .open(&Address::parse("rmq://localhost/orders").unwrap(), None)
            .await
            .unwrap();
        channel
            .basic_publish("", "orders", body, &MessageProperties::default())
            .await
            .unwrap();
        channel.close().await.unwrap();
    }

    fn acking(seen: Arc<Mutex<Vec<Vec<u8>>>>) -> DeliveryCallback {
        Arc::new(move |channel, delivery| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(delivery.data.clone());
                channel.basic_ack(delivery.delivery_tag).await.unwrap();
            }
            .boxed()
        })
    }

    async fn wait_for(predicate: impl Fn() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn zero_concurrency_does_not_consume() {
        let (broker, mut consumer) = setup(0).await;
        publish(&broker, b"1").await;

        consumer
            .start(acking(Arc::new(Mutex::new(vec![]))))
            .await
            .unwrap();

        assert!(!consumer.is_consuming());
        assert_eq!(broker.queue_len("orders"), 1);
    }

    #[tokio::test]
    async fn delivers_and_acks() {
        let (broker, mut consumer) = setup(2).await;
        let seen = Arc::new(Mutex::new(vec![]));
        consumer.start(acking(seen.clone())).await.unwrap();

        publish(&broker, b"1").await;
        publish(&broker, b"2").await;

        wait_for(|| seen.lock().unwrap().len() == 2).await;
        consumer.stop().await;
        assert_eq!(broker.queue_len("orders"), 0);
        assert_eq!(broker.unacked_len("orders"), 0);
    }

    #[tokio::test]
    async fn panics_do_not_kill_the_subscription() {
        let (broker, mut consumer) = setup(1).await;
        let seen = Arc::new(Mutex::new(vec![]));
        let inner = acking(seen.clone());
        let callback: DeliveryCallback = Arc::new(move |channel, delivery| {
            if delivery.data == b"boom" {
                return async move { panic!("handler exploded") }.boxed();
            }
            inner(channel, delivery)
        });
        consumer.start(callback).await.unwrap();

        publish(&broker, b"boom").await;
        publish(&broker, b"ok").await;

        wait_for(|| seen.lock().unwrap().len() == 1).await;
        wait_for(|| consumer.in_flight() == 0).await;
        assert_eq!(broker.unacked_len("orders"), 0);
        assert_eq!(broker.queue_len("orders"), 0);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_deliveries() {
        let (broker, mut consumer) = setup(1).await;
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        let callback: DeliveryCallback = Arc::new(move |channel, delivery| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                channel.basic_ack(delivery.delivery_tag).await.unwrap();
                done.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        consumer.start(callback).await.unwrap();
        publish(&broker, b"slow").await;
        wait_for(|| consumer.in_flight() == 1).await;

        consumer.stop().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(broker.queue_len("orders"), 0);
    }
}
