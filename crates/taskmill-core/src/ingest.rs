//! Async ingest façade over the aggregator.
//!
//! Aggregator access is serialized by one async mutex. Tasks and parents
//! missing from memory are looked up in the backend before the lock is
//! taken, so a slow search never blocks other producers. The same lookup
//! brings back indexed orphans waiting on any of those ids.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregatorStats, TaskAggregator};
use crate::backend::SearchBackend;
use crate::error::Result;
use crate::indexer::{BulkIndexer, IndexReport};
use crate::lifecycle::IndexLifecycle;
use crate::query::TaskQueries;
use crate::task::{Event, MergeSettings, Task, TaskStatus};

/// Generations of indexed orphans pulled back for one batch.
const MAX_ORPHAN_GENERATIONS: usize = 16;

/// Entry point for producer events.
pub struct IngestService<B> {
    aggregator: Mutex<TaskAggregator>,
    indexer: BulkIndexer<B>,
    queries: TaskQueries<B>,
    lifecycle: Arc<IndexLifecycle<B>>,
    default_env: String,
}

impl<B: SearchBackend> IngestService<B> {
    #[must_use]
    pub fn new(
        settings: MergeSettings,
        default_env: impl Into<String>,
        indexer: BulkIndexer<B>,
        queries: TaskQueries<B>,
        lifecycle: Arc<IndexLifecycle<B>>,
    ) -> Self {
        let default_env = default_env.into();
        Self {
            aggregator: Mutex::new(TaskAggregator::new(settings).with_default_env(default_env.clone())),
            indexer,
            queries,
            lifecycle,
            default_env,
        }
    }

    /// Fold one event; returns the task snapshot after the merge.
    pub async fn ingest(&self, event: Event) -> Task {
        self.ingest_batch(vec![event])
            .await
            .pop()
            .unwrap_or_else(|| Task::new(String::new(), TaskStatus::Corrupted))
    }

    /// Fold a batch of events in order; returns one snapshot per event.
    pub async fn ingest_batch(&self, events: Vec<Event>) -> Vec<Task> {
        let unresolved = self.aggregator.lock().await.unresolved_ids(&events);
        let seeded = self.fetch_indexed_state(&unresolved).await;

        let mut aggregator = self.aggregator.lock().await;
        for task in seeded {
            aggregator.seed_indexed(task);
        }
        events.into_iter().map(|e| aggregator.ingest(e)).collect()
    }

    /// Indexed copies of `ids`, followed generation by generation by the
    /// indexed orphans waiting on them. Parents always precede children.
    ///
    /// Lookup failures are logged; events then fold without indexed state.
    async fn fetch_indexed_state(&self, ids: &[String]) -> Vec<Task> {
        if ids.is_empty() {
            return Vec::new();
        }
        let mut found = match self.queries.fetch_indexed_tasks(ids).await {
            Ok(found) => {
                debug!(requested = ids.len(), found = found.len(), "Tasks fetched from backend");
                found
            }
            Err(e) => {
                warn!(error = %e, unresolved = ids.len(), "Task lookup failed, events fold without indexed state");
                return Vec::new();
            }
        };

        let mut seen: HashSet<String> = ids.iter().cloned().collect();
        let mut frontier = ids.to_vec();
        for _ in 0..MAX_ORPHAN_GENERATIONS {
            let orphans = match self.queries.indexed_orphans_of(&frontier).await {
                Ok(orphans) => orphans,
                Err(e) => {
                    warn!(error = %e, parents = frontier.len(), "Orphan lookup failed");
                    break;
                }
            };
            let fresh: Vec<Task> = orphans
                .into_iter()
                .filter(|task| seen.insert(task.id.clone()))
                .collect();
            if fresh.is_empty() {
                break;
            }
            debug!(orphans = fresh.len(), "Indexed orphans fetched for adoption");
            frontier = fresh.iter().map(|task| task.id.clone()).collect();
            found.extend(fresh);
        }
        found
    }

    /// Index every changed task, grouped by environment, then evict finished
    /// tasks from memory.
    pub async fn flush(&self) -> Result<IndexReport> {
        let dirty = self.aggregator.lock().await.drain_dirty();
        if dirty.is_empty() {
            return Ok(IndexReport::default());
        }

        let mut by_env: BTreeMap<String, BTreeMap<String, Task>> = BTreeMap::new();
        for (id, task) in dirty {
            let env = task.env.clone().unwrap_or_else(|| self.default_env.clone());
            by_env.entry(env).or_default().insert(id, task);
        }

        let mut total = IndexReport::default();
        for (env, tasks) in by_env {
            let alias = self.lifecycle.ensure_alias(&env).await;
            let target = self.lifecycle.current_index(&alias).unwrap_or(alias);
            let report = self.indexer.index(&tasks, &target).await?;
            total.batches += report.batches;
            total.failed_batches += report.failed_batches;
            total.operations += report.operations;
            total.failed_operations += report.failed_operations;
        }

        let evicted = self.aggregator.lock().await.evict_completed();
        info!(
            operations = total.operations,
            failed = total.failed_operations,
            evicted,
            "Flushed tasks"
        );
        Ok(total)
    }

    pub async fn stats(&self) -> AggregatorStats {
        self.aggregator.lock().await.stats()
    }

    /// Resident snapshot of a task, if any.
    pub async fn resident(&self, id: &str) -> Option<Task> {
        self.aggregator.lock().await.get(id).cloned()
    }
}
