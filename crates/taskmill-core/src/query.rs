//! Scroll-based task lookups.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{SearchBackend, SearchHit, TaskQuery, index_age_order};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, with_backend_retry};
use crate::task::{Task, TaskStatus};

/// Reads tasks back from the backend.
#[derive(Debug, Clone)]
pub struct TaskQueries<B> {
    backend: B,
    page_size: usize,
    policy: RetryPolicy,
    search_pattern: String,
}

impl<B: SearchBackend> TaskQueries<B> {
    #[must_use]
    pub fn new(backend: B, page_size: usize, policy: RetryPolicy, index_prefix: &str) -> Self {
        Self {
            backend,
            page_size: page_size.max(1),
            policy,
            search_pattern: format!("{index_prefix}*"),
        }
    }

    #[must_use]
    pub fn from_config(backend: B, config: &Config) -> Self {
        Self::new(
            backend,
            config.backend.search_page_size,
            RetryPolicy::backend_admin(
                Duration::from_millis(config.backend.backoff_unit_ms),
                config.backend.max_retries,
            ),
            &config.lifecycle.index_prefix,
        )
    }

    /// Pattern matching every index this deployment writes.
    #[must_use]
    pub fn search_pattern(&self) -> &str {
        &self.search_pattern
    }

    /// Run a scroll to completion. The scroll context is always released.
    pub async fn run_scroll(&self, index: &str, query: &TaskQuery) -> Result<Vec<SearchHit>> {
        let first = with_backend_retry(&self.policy, "open_scroll", || async move {
            self.backend
                .open_scroll(index, query, self.page_size)
                .await
                .map_err(Error::from)
        })
        .await?;

        let mut hits = first.hits;
        let mut scroll_id = first.scroll_id;
        let mut last_page = hits.len();
        let mut result = Ok(());

        while last_page > 0 {
            let Some(id) = scroll_id.clone() else { break };
            let id = id.as_str();
            match with_backend_retry(&self.policy, "scroll", || async move {
                self.backend.scroll(id).await.map_err(Error::from)
            })
            .await
            {
                Ok(page) => {
                    last_page = page.hits.len();
                    hits.extend(page.hits);
                    if page.scroll_id.is_some() {
                        scroll_id = page.scroll_id;
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if let Some(id) = scroll_id {
            if let Err(e) = self.backend.clear_scroll(&id).await {
                warn!(scroll_id = %id, error = %e, "Failed to clear scroll");
            }
        }
        result?;
        debug!(index, hits = hits.len(), "Scroll finished");
        Ok(hits)
    }

    /// Every stored copy of each id, across all indices.
    pub async fn multiple_tasks_by_id(&self, ids: &[String]) -> Result<BTreeMap<String, Vec<SearchHit>>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let hits = self
            .run_scroll(&self.search_pattern, &TaskQuery::Ids(ids.to_vec()))
            .await?;
        let mut grouped: BTreeMap<String, Vec<SearchHit>> = BTreeMap::new();
        for hit in hits {
            grouped.entry(hit.task.id.clone()).or_default().push(hit);
        }
        Ok(grouped)
    }

    /// One task per id. When a task exists in several indices (a migration
    /// copied it but the delete has not happened yet) the copy in the newest
    /// index wins.
    pub async fn tasks_by_ids(&self, ids: &[String]) -> Result<BTreeMap<String, Task>> {
        let grouped = self.multiple_tasks_by_id(ids).await?;
        Ok(newest_per_id(grouped))
    }

    /// Indexed orphans whose parent is one of `parent_ids`.
    pub async fn indexed_orphans_of(&self, parent_ids: &[String]) -> Result<Vec<Task>> {
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let hits = self
            .run_scroll(&self.search_pattern, &TaskQuery::OrphansOf(parent_ids.to_vec()))
            .await?;
        let mut grouped: BTreeMap<String, Vec<SearchHit>> = BTreeMap::new();
        for hit in hits {
            grouped.entry(hit.task.id.clone()).or_default().push(hit);
        }
        Ok(newest_per_id(grouped).into_values().collect())
    }

    pub async fn task_by_id(&self, id: &str) -> Result<Option<Task>> {
        let mut found = self.tasks_by_ids(&[id.to_string()]).await?;
        Ok(found.remove(id))
    }

    /// Tasks still in a partial status in `index`.
    pub async fn index_partial_tasks(&self, index: &str) -> Result<Vec<Task>> {
        let hits = self
            .run_scroll(index, &TaskQuery::Statuses(TaskStatus::PARTIAL.to_vec()))
            .await?;
        Ok(hits.into_iter().map(|h| h.task).collect())
    }

    /// Indexed tasks for ids the aggregator needs as parents.
    pub async fn fetch_indexed_tasks(&self, ids: &[String]) -> Result<Vec<Task>> {
        Ok(self.tasks_by_ids(ids).await?.into_values().collect())
    }
}

fn newest_per_id(grouped: BTreeMap<String, Vec<SearchHit>>) -> BTreeMap<String, Task> {
    grouped
        .into_iter()
        .filter_map(|(id, hits)| {
            if hits.len() > 1 {
                let indices: Vec<&str> = hits.iter().map(|h| h.index.as_str()).collect();
                warn!(task_id = %id, ?indices, "Task found in more than one index");
            }
            hits.into_iter()
                .max_by(|a, b| index_age_order(&a.index, &b.index))
                .map(|hit| (id, hit.task))
        })
        .collect()
}
