//! Transactional produce
//!
//! A [`Transaction`] buffers records and publishes them on [`Transaction::commit`],
//! atomically for read-committed consumers. A producer has at most one open
//! transaction at a time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Span};

use crate::client::{cancellable, ProducerClient, TransactionEnd};
use crate::error::KafkaClientError;
use crate::message::Record;
use crate::metrics::{ClientMetrics, Timer};
use crate::producer::{complete, enqueue, Producer};
use crate::Result;

/// Releases the producer's transaction slot when dropped
struct TransactionGuard(Arc<AtomicBool>);

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct TransactionState {
    buffered: Vec<Record>,
    aborted: bool,
    finished: bool,
    record_count: usize,
    guard: Option<TransactionGuard>,
}

/// Open transactional session of a [`Producer`]
pub struct Transaction {
    client: Arc<dyn ProducerClient>,
    default_topic: String,
    timeout: Duration,
    state: Mutex<TransactionState>,
    metrics: Arc<ClientMetrics>,
    span: Span,
}

impl Transaction {
    /// Buffer `record` for the next commit
    pub fn produce(&self, record: Record) -> Result<()> {
        self.produce_many([record])
    }

    pub fn produce_many<I>(&self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut state = self.state.lock();
        if state.finished || state.aborted {
            return Err(KafkaClientError::TransactionAborted);
        }
        let before = state.buffered.len();
        state.buffered.extend(records);
        state.record_count += state.buffered.len() - before;
        Ok(())
    }

    /// Publish the buffered records and commit.
    ///
    /// If any record fails the transaction is aborted and that record's error
    /// returned. Not cancellable: once started it runs until the transaction
    /// is committed or aborted, bounded by the producer's delivery timeout.
    pub async fn commit(&self) -> Result<()> {
        let (records, _guard) = {
            let mut state = self.state.lock();
            if state.finished || state.aborted {
                return Err(KafkaClientError::TransactionAborted);
            }
            state.finished = true;
            (std::mem::take(&mut state.buffered), state.guard.take())
        };

        let count = records.len();
        let pending: Vec<_> = records
            .into_iter()
            .map(|mut record| {
                if record.topic.is_empty() {
                    record.topic = self.default_topic.clone();
                }
                let delivery = enqueue(self.client.as_ref(), &record, &self.default_topic);
                (record, delivery, Timer::start())
            })
            .collect();

        for (record, delivery, timer) in pending {
            let outcome = match delivery {
                Ok(delivery) => delivery.await,
                Err(err) => Err(err),
            };
            let result = complete(&self.metrics, &self.span, record, outcome, timer);
            if let Some(err) = result.error {
                self.state.lock().aborted = true;
                self.rollback().await;
                return Err(err);
            }
        }

        if let Err(err) = self
            .client
            .end_transaction(TransactionEnd::Commit, self.timeout)
            .await
        {
            error!(parent: &self.span, error = %err, "Failed to commit transaction");
            self.state.lock().aborted = true;
            self.rollback().await;
            return Err(err);
        }

        self.metrics.record_transaction(true);
        info!(parent: &self.span, records = count, "Transaction committed");
        Ok(())
    }

    /// Drop the buffered records and abort. A no-op once finished.
    ///
    /// The transaction is ended even when dropping buffered records fails;
    /// the first error is returned.
    pub async fn abort(&self) -> Result<()> {
        let _guard = {
            let mut state = self.state.lock();
            if state.finished {
                return Ok(());
            }
            state.aborted = true;
            state.finished = true;
            state.buffered.clear();
            state.guard.take()
        };

        let purged = self.client.abort_buffered_records().await;
        if let Err(err) = &purged {
            warn!(parent: &self.span, error = %err, "Failed to drop buffered records");
        }
        let ended = self
            .client
            .end_transaction(TransactionEnd::Abort, self.timeout)
            .await;
        self.metrics.record_transaction(false);
        info!(parent: &self.span, "Transaction aborted");
        purged.and(ended)
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Records produced into this transaction so far
    pub fn record_count(&self) -> usize {
        self.state.lock().record_count
    }

    async fn rollback(&self) {
        if let Err(err) = self.client.abort_buffered_records().await {
            warn!(parent: &self.span, error = %err, "Failed to drop buffered records");
        }
        if let Err(err) = self
            .client
            .end_transaction(TransactionEnd::Abort, self.timeout)
            .await
        {
            error!(parent: &self.span, error = %err, "Failed to abort transaction");
        }
        self.metrics.record_transaction(false);
        info!(parent: &self.span, "Transaction aborted");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.finished {
            return;
        }
        state.finished = true;
        state.aborted = true;
        let guard = state.guard.take();

        warn!(parent: &self.span, "Transaction dropped while open, aborting");
        let client = self.client.clone();
        let timeout = self.timeout;
        let metrics = self.metrics.clone();
        let span = self.span.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _guard = guard;
                    if let Err(err) = client.end_transaction(TransactionEnd::Abort, timeout).await {
                        error!(parent: &span, error = %err, "Failed to abort dropped transaction");
                    }
                    metrics.record_transaction(false);
                });
            }
            Err(_) => error!(parent: &span, "No runtime to abort dropped transaction"),
        }
    }
}

impl Producer {
    /// Start a transaction.
    ///
    /// Fails with `NoTransactionalId` on a non-transactional producer and with
    /// `TransactionInProgress` while another transaction is open.
    pub async fn begin_transaction(&self, token: &CancellationToken) -> Result<Transaction> {
        let Some(transactional_id) = self.config.transactional_id() else {
            return Err(KafkaClientError::NoTransactionalId);
        };
        let client = self.slot.snapshot()?;

        if self
            .transaction_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(KafkaClientError::TransactionInProgress);
        }
        let guard = TransactionGuard(self.transaction_active.clone());

        cancellable(token, client.begin_transaction()).await?;
        info!(parent: &self.span, transactional_id, "Transaction started");

        Ok(Transaction {
            client,
            default_topic: self.config.default_topic.clone(),
            timeout: self.config.delivery_timeout,
            state: Mutex::new(TransactionState {
                buffered: Vec::new(),
                aborted: false,
                finished: false,
                record_count: 0,
                guard: Some(guard),
            }),
            metrics: self.metrics.clone(),
            span: self.span.clone(),
        })
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`. Aborts when it returns an error, which is
    /// then returned, or when it panics, after which the panic resumes.
    pub async fn transact<F>(&self, token: &CancellationToken, f: F) -> Result<()>
    where
        F: FnOnce(&Transaction) -> Result<()>,
    {
        let tx = self.begin_transaction(token).await?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&tx)));
        self.finish(token, tx, outcome).await
    }

    /// Async counterpart of [`Producer::transact`]
    ///
    /// ```no_run
    /// # use blueprint_kafka::{CancellationToken, Producer, Record};
    /// # use futures::FutureExt;
    /// # async fn run(producer: Producer) -> blueprint_kafka::Result<()> {
    /// let token = CancellationToken::new();
    /// producer
    ///     .transact_async(&token, |tx| {
    ///         async move {
    ///             tx.produce(Record::new("a"))?;
    ///             tx.produce(Record::new("b"))
    ///         }
    ///         .boxed()
    ///     })
    ///     .await
    /// # }
    /// ```
    pub async fn transact_async<F>(&self, token: &CancellationToken, f: F) -> Result<()>
    where
        F: for<'t> FnOnce(&'t Transaction) -> BoxFuture<'t, Result<()>>,
    {
        let tx = self.begin_transaction(token).await?;
        let outcome = AssertUnwindSafe(async { f(&tx).await }).catch_unwind().await;
        self.finish(token, tx, outcome).await
    }

    /// Publish `records` in one transaction
    pub async fn transact_records<I>(&self, token: &CancellationToken, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Record>,
    {
        self.transact(token, move |tx| tx.produce_many(records)).await
    }

    async fn finish(
        &self,
        token: &CancellationToken,
        tx: Transaction,
        outcome: std::thread::Result<Result<()>>,
    ) -> Result<()> {
        match outcome {
            Ok(Ok(())) if token.is_cancelled() => {
                abort_quietly(&tx).await;
                Err(KafkaClientError::Cancelled)
            }
            Ok(Ok(())) => tx.commit().await,
            Ok(Err(err)) => {
                abort_quietly(&tx).await;
                Err(err)
            }
            Err(payload) => {
                abort_quietly(&tx).await;
                drop(tx);
                panic::resume_unwind(payload)
            }
        }
    }
}

async fn abort_quietly(tx: &Transaction) {
    if let Err(err) = tx.abort().await {
        error!(parent: &tx.span, error = %err, "Failed to abort transaction");
    }
}
