//! Resilient bulk indexing pipeline.
//!
//! Dirty task snapshots are cut into size-bounded batches and sent on a
//! bounded pool of concurrent bulk calls. A batch (or the failed subset of a
//! batch) that does not land goes through three tiers:
//!
//! 1. the bounded in-memory retry queue, resent by
//!    [`BulkIndexer::retry_failed_from_memory`] with an increasing retry number
//! 2. the durable [`FailureQueue`] once `max_retries` is reached
//! 3. dropped, with a counter, when the queue is disabled, full, or the batch
//!    has already been fetched `max_bulk_fetches` times

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::SearchBackend;
use crate::bulk::{BulkBatch, build_batches};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::failure_queue::FailureQueue;
use crate::task::Task;

/// Pipeline tuning, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub bulk_max_bytes: usize,
    pub indexing_threads: usize,
    pub max_retries: u32,
    pub retry_queue_capacity: usize,
    pub max_bulk_fetches: u32,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for IndexerSettings {
    fn from(config: &Config) -> Self {
        Self {
            bulk_max_bytes: config.indexing.bulk_max_bytes,
            indexing_threads: config.indexing.indexing_threads,
            max_retries: config.indexing.max_retries,
            retry_queue_capacity: config.indexing.retry_queue_capacity,
            max_bulk_fetches: config.persistence.max_bulk_fetches,
        }
    }
}

#[derive(Debug, Default)]
struct PersistenceCounters {
    persisted: AtomicU64,
    redelivered_from_disk: AtomicU64,
    fetched_max_times: AtomicU64,
    could_not_persist: AtomicU64,
    retry_queue_dropped: AtomicU64,
    dropped_without_persistence: AtomicU64,
}

impl PersistenceCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PersistenceStats {
        PersistenceStats {
            persisted: self.persisted.load(Ordering::Relaxed),
            redelivered_from_disk: self.redelivered_from_disk.load(Ordering::Relaxed),
            fetched_max_times: self.fetched_max_times.load(Ordering::Relaxed),
            could_not_persist: self.could_not_persist.load(Ordering::Relaxed),
            retry_queue_dropped: self.retry_queue_dropped.load(Ordering::Relaxed),
            dropped_without_persistence: self.dropped_without_persistence.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the batch routing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceStats {
    /// Batches written to the failure queue for the first time
    pub persisted: u64,
    /// Batches from the failure queue that were delivered
    pub redelivered_from_disk: u64,
    /// Batches dropped after reaching the fetch limit
    pub fetched_max_times: u64,
    /// Batches the failure queue refused to store
    pub could_not_persist: u64,
    /// Batches dropped because the retry queue was full
    pub retry_queue_dropped: u64,
    /// Batches dropped because persistence is disabled
    pub dropped_without_persistence: u64,
}

/// Summary of one round of bulk calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub batches: usize,
    pub failed_batches: usize,
    pub operations: usize,
    pub failed_operations: usize,
}

impl IndexReport {
    fn record(&mut self, outcome: BatchOutcome) {
        self.batches += 1;
        self.operations += outcome.operations;
        self.failed_operations += outcome.failed_operations;
        if outcome.failed_operations > 0 {
            self.failed_batches += 1;
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_batches == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct BatchOutcome {
    operations: usize,
    failed_operations: usize,
}

struct RetryEntry {
    batch: BulkBatch,
    retry_num: u32,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Counts one bulk call for the lifetime of the guard.
struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl InFlightGuard {
    fn new(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self {
            in_flight: Arc::clone(in_flight),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

struct Inner<B> {
    backend: B,
    settings: IndexerSettings,
    permits: Arc<Semaphore>,
    retry_queue: ArrayQueue<RetryEntry>,
    failure_queue: Option<Arc<FailureQueue>>,
    counters: PersistenceCounters,
    closed: AtomicBool,
    in_flight: Arc<InFlight>,
}

/// Bulk indexing pipeline. Clones share one pool, queue and counter set.
pub struct BulkIndexer<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for BulkIndexer<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: SearchBackend> BulkIndexer<B> {
    /// Build a pipeline. `failure_queue == None` disables persistence.
    #[must_use]
    pub fn new(
        backend: B,
        settings: IndexerSettings,
        failure_queue: Option<Arc<FailureQueue>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.indexing_threads.max(1)));
        let retry_queue = ArrayQueue::new(settings.retry_queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                backend,
                settings,
                permits,
                retry_queue,
                failure_queue,
                counters: PersistenceCounters::default(),
                closed: AtomicBool::new(false),
                in_flight: Arc::new(InFlight::default()),
            }),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    #[must_use]
    pub fn failure_queue(&self) -> Option<&Arc<FailureQueue>> {
        self.inner.failure_queue.as_ref()
    }

    #[must_use]
    pub fn persistence_stats(&self) -> PersistenceStats {
        self.inner.counters.snapshot()
    }

    #[must_use]
    pub fn retry_queue_len(&self) -> usize {
        self.inner.retry_queue.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Runtime("bulk indexer is closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Upsert every task into `target_index`.
    ///
    /// Returns once every batch has either landed or been routed to a retry
    /// tier; a failed batch is not an error here.
    pub async fn index(
        &self,
        tasks: &BTreeMap<String, Task>,
        target_index: &str,
    ) -> Result<IndexReport> {
        self.ensure_open()?;
        if tasks.is_empty() {
            return Ok(IndexReport::default());
        }
        let batches = build_batches(tasks, target_index, self.inner.settings.bulk_max_bytes);
        debug!(
            tasks = tasks.len(),
            batches = batches.len(),
            index = target_index,
            "Indexing tasks"
        );
        self.send_all(batches.into_iter().map(|b| (b, 0)).collect())
            .await
    }

    async fn send_all(&self, entries: Vec<(BulkBatch, u32)>) -> Result<IndexReport> {
        let mut join_set = JoinSet::new();
        for (batch, retry_num) in entries {
            let permit = Arc::clone(&self.inner.permits)
                .acquire_owned()
                .await
                .map_err(|_| Error::Runtime("indexing pool closed".to_string()))?;
            let this = self.clone();
            join_set.spawn(async move {
                let _permit = permit;
                this.send_batch(batch, retry_num).await
            });
        }

        let mut report = IndexReport::default();
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined.map_err(|e| Error::Runtime(format!("bulk task failed: {e}")))?;
            report.record(outcome);
        }
        Ok(report)
    }

    async fn send_batch(&self, batch: BulkBatch, retry_num: u32) -> BatchOutcome {
        let _guard = InFlightGuard::new(&self.inner.in_flight);
        let operations = batch.len();

        match self.inner.backend.bulk(&batch.operations).await {
            Ok(response) => {
                let failed = batch.failed_subset(&response);
                if !failed.is_empty() {
                    let failed_operations = failed.len();
                    warn!(
                        operations,
                        failed_operations,
                        retry_num,
                        first_error = response
                            .first_failure()
                            .unwrap_or("operation missing from bulk response"),
                        "Bulk request partially failed"
                    );
                    self.handle_failure(failed, retry_num).await;
                    return BatchOutcome {
                        operations,
                        failed_operations,
                    };
                }
                if batch.times_fetched > 0 {
                    PersistenceCounters::bump(&self.inner.counters.redelivered_from_disk);
                    info!(
                        operations,
                        times_fetched = batch.times_fetched,
                        "Batch from failure queue delivered"
                    );
                }
                BatchOutcome {
                    operations,
                    failed_operations: 0,
                }
            }
            Err(e) => {
                warn!(operations, retry_num, error = %e, "Bulk request failed");
                self.handle_failure(batch, retry_num).await;
                BatchOutcome {
                    operations,
                    failed_operations: operations,
                }
            }
        }
    }

    async fn handle_failure(&self, batch: BulkBatch, retry_num: u32) {
        let counters = &self.inner.counters;
        if batch.is_empty() {
            return;
        }

        if retry_num < self.inner.settings.max_retries {
            if self
                .inner
                .retry_queue
                .push(RetryEntry { batch, retry_num })
                .is_err()
            {
                PersistenceCounters::bump(&counters.retry_queue_dropped);
                error!(retry_num, "Retry queue is full, dropping batch");
            }
            return;
        }

        let Some(queue) = self.inner.failure_queue.clone() else {
            PersistenceCounters::bump(&counters.dropped_without_persistence);
            error!(
                operations = batch.len(),
                "Batch exhausted retries and persistence is disabled, dropping"
            );
            return;
        };

        if batch.times_fetched >= self.inner.settings.max_bulk_fetches {
            PersistenceCounters::bump(&counters.fetched_max_times);
            error!(
                operations = batch.len(),
                times_fetched = batch.times_fetched,
                "Batch reached the fetch limit, dropping"
            );
            return;
        }

        let first_time = batch.times_fetched == 0;
        let stored = tokio::task::spawn_blocking(move || queue.persist(&batch)).await;
        match stored {
            Ok(Ok(())) => {
                if first_time {
                    PersistenceCounters::bump(&counters.persisted);
                }
            }
            Ok(Err(e)) => {
                PersistenceCounters::bump(&counters.could_not_persist);
                error!(error = %e, "Failed to persist batch to failure queue");
            }
            Err(e) => {
                PersistenceCounters::bump(&counters.could_not_persist);
                error!(error = %e, "Failure queue insert task failed");
            }
        }
    }

    /// Resend everything in the retry queue with the retry number bumped.
    pub async fn retry_failed_from_memory(&self) -> Result<IndexReport> {
        self.ensure_open()?;
        let mut entries = Vec::new();
        while let Some(entry) = self.inner.retry_queue.pop() {
            entries.push((entry.batch, entry.retry_num + 1));
        }
        if entries.is_empty() {
            return Ok(IndexReport::default());
        }
        info!(batches = entries.len(), "Retrying failed batches from memory");
        self.send_all(entries).await
    }

    /// Pull one round of batches from the failure queue and resend them.
    ///
    /// Returns `true` when batches were fetched and every one was delivered,
    /// meaning another round is worth running right away.
    pub async fn retry_failed_from_disk(&self) -> Result<bool> {
        self.ensure_open()?;
        let Some(queue) = self.inner.failure_queue.clone() else {
            return Ok(false);
        };
        let stats = self.persistence_stats();
        info!(
            persisted = stats.persisted,
            redelivered = stats.redelivered_from_disk,
            fetched_max_times = stats.fetched_max_times,
            could_not_persist = stats.could_not_persist,
            retry_queue_dropped = stats.retry_queue_dropped,
            "Failure queue counters"
        );

        let batches = tokio::task::spawn_blocking(move || queue.fetch_and_delete_failed_bulks())
            .await
            .map_err(|e| Error::Runtime(format!("failure queue fetch task failed: {e}")))??;
        if batches.is_empty() {
            return Ok(false);
        }

        info!(batches = batches.len(), "Retrying batches from failure queue");
        let report = self
            .send_all(batches.into_iter().map(|b| (b, 0)).collect())
            .await?;
        Ok(report.is_clean())
    }

    /// Refuse new work and wait for in-flight bulk calls to finish.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let idle = self.inner.in_flight.idle.notified();
            if self.inner.in_flight.count.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }
        let pending = self.retry_queue_len();
        if pending > 0 {
            warn!(pending, "Bulk indexer closed with batches still in the retry queue");
        }
        info!("Bulk indexer closed");
    }
}
