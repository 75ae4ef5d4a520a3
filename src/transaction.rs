// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Unit-of-Work Transactions
//!
//! A `Transaction` groups everything one unit of work does against the broker:
//! the transactional channels it published on, the completion callbacks
//! (deferred publishes) enlisted along the way, and the settlements (ack/nack
//! of the inbound delivery) that report the outcome.
//!
//! Ending it runs two phases. The commit phase replays every completion, then
//! commits each channel; the first failure turns the remaining work into a
//! rollback. Settlements run afterwards with the outcome that actually took
//! effect, so an inbound delivery is acknowledged only once everything it
//! published is committed.
//!
//! The handle is passed explicitly to every call that needs it. The only
//! implicit propagation is `Transaction::scope`, used where a new unit of work
//! begins (delivery dispatch), so that `Transaction::begin` can refuse to nest.

use crate::{
    broker::BrokerChannel,
    errors::{BusError, TransactionError},
    registry::ConnectionKey,
};
use futures_util::future::BoxFuture;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, error};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: Transaction;
}

type Completion = Box<dyn FnOnce(bool) -> BoxFuture<'static, Result<(), BusError>> + Send>;

struct Inner {
    id: Uuid,
    commit: AtomicBool,
    /// The commit phase has run.
    finished: AtomicBool,
    /// Outcome that took effect in the commit phase.
    committed: AtomicBool,
    disposed: AtomicBool,
    completions: Mutex<Vec<Completion>>,
    settlements: Mutex<Vec<Completion>>,
    channels: Mutex<Vec<(ConnectionKey, Arc<dyn BrokerChannel>)>>,
}

/// Handle to one unit of work. Clones share the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("commit", &self.inner.commit.load(Ordering::SeqCst))
            .field("disposed", &self.inner.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Transaction {
    /// Creates a detached transaction, not installed in any scope.
    pub fn new() -> Transaction {
        Transaction {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                commit: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                committed: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                completions: Mutex::new(vec![]),
                settlements: Mutex::new(vec![]),
                channels: Mutex::new(vec![]),
            }),
        }
    }

    /// Starts a new unit of work. Fails when the calling task already runs
    /// inside the scope of a live transaction.
    pub fn begin() -> Result<Transaction, TransactionError> {
        if Self::current().is_some() {
            return Err(TransactionError::AlreadyActive);
        }
        Ok(Self::new())
    }

    /// The live transaction whose scope the calling task runs in, if any.
    pub fn current() -> Option<Transaction> {
        CURRENT
            .try_with(|tx| tx.clone())
            .ok()
            .filter(|tx| !tx.is_disposed())
    }

    /// Runs `fut` with this transaction installed as the current one.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, fut).await
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Registers a callback invoked once, in the commit phase, with whether
    /// the unit of work is still committing. Callbacks run in registration
    /// order; the first one failing on commit turns the rest into a rollback.
    pub fn enlist<F, Fut>(&self, completion: F)
    where
        F: FnOnce(bool) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        let boxed: Completion = Box::new(move |commit| Box::pin(completion(commit)));
        match self.inner.completions.lock() {
            Ok(mut completions) => completions.push(boxed),
            Err(poisoned) => poisoned.into_inner().push(boxed),
        }
    }

    /// Registers a callback invoked once, after the commit phase, with the
    /// outcome that took effect.
    pub fn enlist_settlement<F, Fut>(&self, settlement: F)
    where
        F: FnOnce(bool) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        let boxed: Completion = Box::new(move |commit| Box::pin(settlement(commit)));
        match self.inner.settlements.lock() {
            Ok(mut settlements) => settlements.push(boxed),
            Err(poisoned) => poisoned.into_inner().push(boxed),
        }
    }

    /// Marks the outcome as commit. Without it, disposal rolls back.
    pub fn complete(&self) {
        self.inner.commit.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.inner.commit.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Transactional channel already opened in this unit of work for `key`.
    pub(crate) fn channel(&self, key: &ConnectionKey) -> Option<Arc<dyn BrokerChannel>> {
        let channels = match self.inner.channels.lock() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, channel)| channel.clone())
    }

    pub(crate) fn add_channel(&self, key: ConnectionKey, channel: Arc<dyn BrokerChannel>) {
        match self.inner.channels.lock() {
            Ok(mut channels) => channels.push((key, channel)),
            Err(poisoned) => poisoned.into_inner().push((key, channel)),
        }
    }

    /// Runs the commit phase now instead of at disposal.
    ///
    /// # Returns
    /// The error that forced a rollback, or `RolledBack` when the unit of
    /// work was not completed or was already rolled back
    pub async fn prepare(&self) -> Result<(), BusError> {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return if self.inner.committed.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransactionError::RolledBack.into())
            };
        }

        let commit = self.inner.commit.load(Ordering::SeqCst);
        self.finish(commit).await?;
        if commit {
            Ok(())
        } else {
            Err(TransactionError::RolledBack.into())
        }
    }

    async fn finish(&self, commit: bool) -> Result<(), BusError> {
        debug!(transaction = %self.inner.id, commit, "finishing transaction");
        let mut failure: Option<BusError> = None;

        let completions = match self.inner.completions.lock() {
            Ok(mut completions) => std::mem::take(&mut *completions),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for completion in completions {
            let proceed = commit && failure.is_none();
            if let Err(err) = completion(proceed).await {
                error!(
                    error = err.to_string(),
                    commit = proceed,
                    "error performing transaction completion"
                );
                if proceed {
                    failure = Some(err);
                }
            }
        }

        let channels = match self.inner.channels.lock() {
            Ok(mut channels) => std::mem::take(&mut *channels),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (key, channel) in channels {
            let proceed = commit && failure.is_none();
            let outcome = if proceed {
                channel.tx_commit().await
            } else {
                channel.tx_rollback().await
            };
            if let Err(err) = outcome {
                error!(
                    error = err.to_string(),
                    broker = key.to_string(),
                    commit = proceed,
                    "error finishing transaction"
                );
                if proceed {
                    failure = Some(err.into());
                }
            }
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "error closing transactional channel");
            }
        }

        self.inner
            .committed
            .store(commit && failure.is_none(), Ordering::SeqCst);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Ends the unit of work, running the commit phase if `prepare` did not,
    /// then every settlement.
    ///
    /// Only a second call fails. Errors raised by callbacks or channels are
    /// logged and swallowed so that disposal can run from any cleanup path.
    pub async fn dispose(&self) -> Result<(), TransactionError> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Err(TransactionError::AlreadyDisposed);
        }

        if !self.inner.finished.swap(true, Ordering::SeqCst) {
            let commit = self.inner.commit.load(Ordering::SeqCst);
            if let Err(err) = self.finish(commit).await {
                error!(
                    error = err.to_string(),
                    transaction = %self.inner.id,
                    "transaction rolled back on disposal"
                );
            }
        }

        let committed = self.inner.committed.load(Ordering::SeqCst);
        let settlements = match self.inner.settlements.lock() {
            Ok(mut settlements) => std::mem::take(&mut *settlements),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for settlement in settlements {
            if let Err(err) = settlement(committed).await {
                error!(
                    error = err.to_string(),
                    committed, "error settling transaction"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBrokerChannel, errors::AmqpError, registry::Protocol};
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn callbacks_run_in_order_with_the_outcome() {
        let seen = Arc::new(StdMutex::new(vec![]));
        let tx = Transaction::new();

        for i in 0..3 {
            let seen = seen.clone();
            tx.enlist(move |commit| async move {
                seen.lock().unwrap().push((i, commit));
                Ok(())
            });
        }
        tx.complete();
        tx.dispose().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(0, true), (1, true), (2, true)]);
    }

    #[tokio::test]
    async fn rollback_is_the_default() {
        let outcome = Arc::new(StdMutex::new(None));
        let tx = Transaction::new();
        let captured = outcome.clone();
        tx.enlist(move |commit| async move {
            *captured.lock().unwrap() = Some(commit);
            Ok(())
        });

        tx.dispose().await.unwrap();

        assert_eq!(*outcome.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn failing_callback_does_not_stop_the_others() {
        let ran = Arc::new(AtomicBool::new(false));
        let tx = Transaction::new();
        tx.enlist(|_| async { Err(BusError::Processing("boom".to_owned())) });
        let flag = ran.clone();
        tx.enlist(move |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(tx.dispose().await.is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    fn key(broker: &str) -> ConnectionKey {
        ConnectionKey {
            protocol: Protocol::Amqp,
            broker: broker.to_owned(),
            virtual_host: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }

    fn settled(tx: &Transaction) -> Arc<StdMutex<Option<bool>>> {
        let outcome = Arc::new(StdMutex::new(None));
        let captured = outcome.clone();
        tx.enlist_settlement(move |committed| async move {
            *captured.lock().unwrap() = Some(committed);
            Ok(())
        });
        outcome
    }

    #[tokio::test]
    async fn failed_completion_rolls_back_the_rest() {
        let tx = Transaction::new();
        let outcome = settled(&tx);
        let later = Arc::new(StdMutex::new(None));
        tx.enlist(|_| async { Err(BusError::Transport("publish refused".to_owned())) });
        let captured = later.clone();
        tx.enlist(move |commit| async move {
            *captured.lock().unwrap() = Some(commit);
            Ok(())
        });

        let mut channel = MockBrokerChannel::new();
        channel.expect_tx_commit().never();
        channel.expect_tx_rollback().times(1).returning(|| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));
        tx.add_channel(key("localhost"), Arc::new(channel));

        tx.complete();
        assert_eq!(
            tx.prepare().await,
            Err(BusError::Transport("publish refused".to_owned()))
        );
        tx.dispose().await.unwrap();

        assert_eq!(*later.lock().unwrap(), Some(false));
        assert_eq!(*outcome.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn settlements_follow_the_channel_commits() {
        let tx = Transaction::new();
        let outcome = settled(&tx);

        let mut failing = MockBrokerChannel::new();
        failing
            .expect_tx_commit()
            .times(1)
            .returning(|| Err(AmqpError::TxCommitError));
        failing.expect_close().returning(|| Ok(()));
        let mut second = MockBrokerChannel::new();
        second.expect_tx_commit().never();
        second.expect_tx_rollback().times(1).returning(|| Ok(()));
        second.expect_close().returning(|| Ok(()));
        tx.add_channel(key("first"), Arc::new(failing));
        tx.add_channel(key("second"), Arc::new(second));

        tx.complete();
        tx.dispose().await.unwrap();

        assert_eq!(*outcome.lock().unwrap(), Some(false));
        assert_eq!(
            tx.prepare().await,
            Err(BusError::Transaction(TransactionError::RolledBack))
        );
    }

    #[tokio::test]
    async fn settlements_see_a_commit() {
        let tx = Transaction::new();
        let outcome = settled(&tx);
        let mut channel = MockBrokerChannel::new();
        channel.expect_tx_commit().times(1).returning(|| Ok(()));
        channel.expect_close().returning(|| Ok(()));
        tx.add_channel(key("localhost"), Arc::new(channel));

        tx.complete();
        tx.prepare().await.unwrap();
        assert_eq!(*outcome.lock().unwrap(), None);
        tx.dispose().await.unwrap();

        assert_eq!(*outcome.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn double_dispose_fails() {
        let tx = Transaction::new();
        tx.dispose().await.unwrap();
        assert_eq!(tx.dispose().await, Err(TransactionError::AlreadyDisposed));
    }

    #[tokio::test]
    async fn begin_refuses_to_nest() {
        let outer = Transaction::begin().unwrap();
        outer
            .clone()
            .scope(async {
                assert!(Transaction::current().is_some());
                assert_eq!(
                    Transaction::begin().unwrap_err(),
                    TransactionError::AlreadyActive
                );
            })
            .await;
        assert!(Transaction::current().is_none());
        outer.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn scopes_do_not_leak_across_tasks() {
        let tx = Transaction::new();
        tx.clone()
            .scope(async {
                let other = tokio::spawn(async { Transaction::current().is_none() });
                assert!(other.await.unwrap());
            })
            .await;
    }
}
