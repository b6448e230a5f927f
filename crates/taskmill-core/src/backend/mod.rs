//! Search backend boundary.
//!
//! [`SearchBackend`] is the narrow slice of an Elasticsearch-style API the
//! pipeline needs: bulk upsert, scroll search, alias/index administration,
//! stored scripts and delete-by-query. Two implementations ship:
//!
//! - [`MemoryBackend`]: in-process store with failure injection
//! - [`HttpBackend`]: REST client over `reqwest`
//!
//! Methods return `Send` futures so callers can dispatch them on spawned tasks.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::bulk::{BulkResponse, UpsertOperation};
use crate::error::BackendError;
use crate::task::{Task, TaskStatus};

mod http;
mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Keep-alive used for every scroll context.
pub const SCROLL_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Id of the stored script that merges a partial task into the stored one.
pub const MERGE_SCRIPT_ID: &str = "taskmill-merge";

/// Selection of tasks for search and delete-by-query.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskQuery {
    Ids(Vec<String>),
    Statuses(Vec<TaskStatus>),
    /// Tasks whose `date_to_delete` is at or before the instant
    ExpiredAt(DateTime<Utc>),
    /// Orphans still waiting for one of these parents
    OrphansOf(Vec<String>),
}

impl TaskQuery {
    /// Elasticsearch query DSL for this selection.
    #[must_use]
    pub fn to_query_dsl(&self) -> Value {
        match self {
            Self::Ids(ids) => json!({ "ids": { "values": ids } }),
            Self::Statuses(statuses) => {
                let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
                json!({ "terms": { "status": names } })
            }
            Self::ExpiredAt(at) => json!({
                "range": { "date_to_delete": { "lte": at.to_rfc3339() } }
            }),
            Self::OrphansOf(parents) => json!({
                "bool": {
                    "filter": [
                        { "terms": { "parent_id": parents } },
                        { "term": { "orphan": true } },
                    ]
                }
            }),
        }
    }

    /// Evaluate the selection against a task held in memory.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            Self::Ids(ids) => ids.iter().any(|id| *id == task.id),
            Self::Statuses(statuses) => statuses.contains(&task.status),
            Self::ExpiredAt(at) => task.date_to_delete.is_some_and(|d| d <= *at),
            Self::OrphansOf(parents) => {
                task.orphan
                    && task
                        .parent_id
                        .as_deref()
                        .is_some_and(|p| parents.iter().any(|id| id == p))
            }
        }
    }
}

/// A task together with the concrete index it was found in.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub index: String,
    pub task: Task,
}

/// One page of a scroll search.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScrollPage {
    pub scroll_id: Option<String>,
    pub hits: Vec<SearchHit>,
}

/// Thresholds passed to a rollover request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverConditions {
    pub max_age_days: u32,
    pub max_size_gb: u32,
    pub max_docs: u64,
}

impl RolloverConditions {
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "conditions": {
                "max_age": format!("{}d", self.max_age_days),
                "max_size": format!("{}gb", self.max_size_gb),
                "max_docs": self.max_docs,
            }
        })
    }
}

/// Result of a rollover request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverOutcome {
    pub rolled_over: bool,
    pub old_index: String,
    pub new_index: String,
}

/// Index template installed at bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexTemplate {
    pub name: String,
    pub index_patterns: Vec<String>,
    pub shards: u32,
    pub replicas: u32,
    pub max_total_fields: u32,
    pub mappings: Value,
}

impl IndexTemplate {
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "index_patterns": self.index_patterns,
            "template": {
                "settings": {
                    "number_of_shards": self.shards,
                    "number_of_replicas": self.replicas,
                    "mapping": { "total_fields": { "limit": self.max_total_fields } },
                },
                "mappings": self.mappings,
            }
        })
    }
}

/// Name of the index that follows `index` on rollover (`foo-000007` to `foo-000008`).
#[must_use]
pub fn next_rollover_name(index: &str) -> String {
    match (index.rsplit_once('-'), rollover_serial(index)) {
        (Some((base, serial)), Some(current)) => {
            format!("{base}-{:0width$}", current.saturating_add(1), width = serial.len().max(6))
        }
        _ => format!("{index}-000001"),
    }
}

/// Numeric rollover suffix of a concrete index name.
#[must_use]
pub fn rollover_serial(index: &str) -> Option<u64> {
    let (_, serial) = index.rsplit_once('-')?;
    if serial.is_empty() || !serial.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    serial.parse().ok()
}

/// Orders concrete indices oldest first: by rollover serial, then by name.
#[must_use]
pub fn index_age_order(a: &str, b: &str) -> std::cmp::Ordering {
    rollover_serial(a)
        .cmp(&rollover_serial(b))
        .then_with(|| a.cmp(b))
}

/// Operations the indexing pipeline and lifecycle manager need from a backend.
pub trait SearchBackend: Send + Sync + 'static {
    /// Upsert every operation through the stored merge script.
    fn bulk(
        &self,
        operations: &[UpsertOperation],
    ) -> impl Future<Output = BackendResult<BulkResponse>> + Send;

    /// Start a scroll search over `index` (alias, concrete name or pattern).
    fn open_scroll(
        &self,
        index: &str,
        query: &TaskQuery,
        page_size: usize,
    ) -> impl Future<Output = BackendResult<ScrollPage>> + Send;

    /// Next page of an open scroll.
    fn scroll(&self, scroll_id: &str) -> impl Future<Output = BackendResult<ScrollPage>> + Send;

    fn clear_scroll(&self, scroll_id: &str) -> impl Future<Output = BackendResult<()>> + Send;

    /// Concrete indices behind `alias`, write index last; empty when missing.
    fn alias_indices(&self, alias: &str) -> impl Future<Output = BackendResult<Vec<String>>> + Send;

    /// Create `index`, optionally as the write index of `alias`.
    fn create_index(
        &self,
        index: &str,
        alias: Option<&str>,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    fn put_template(
        &self,
        template: &IndexTemplate,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    fn put_script(&self, id: &str, source: &str)
    -> impl Future<Output = BackendResult<()>> + Send;

    fn rollover(
        &self,
        alias: &str,
        conditions: &RolloverConditions,
    ) -> impl Future<Output = BackendResult<RolloverOutcome>> + Send;

    /// Delete matching tasks. With `wait == false` the backend returns a
    /// task handle immediately instead of a deleted count.
    fn delete_by_query(
        &self,
        index: &str,
        query: &TaskQuery,
        wait: bool,
    ) -> impl Future<Output = BackendResult<DeleteByQueryAck>> + Send;
}

/// Acknowledgement of a delete-by-query request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeleteByQueryAck {
    /// Background task handle when not waiting for completion
    pub task: Option<String>,
    /// Deleted documents when waiting for completion
    pub deleted: Option<u64>,
}

/// Backend chosen at runtime from configuration.
#[derive(Debug, Clone)]
pub enum AnyBackend {
    Memory(MemoryBackend),
    Http(HttpBackend),
}

impl SearchBackend for AnyBackend {
    async fn bulk(&self, operations: &[UpsertOperation]) -> BackendResult<BulkResponse> {
        match self {
            Self::Memory(b) => b.bulk(operations).await,
            Self::Http(b) => b.bulk(operations).await,
        }
    }

    async fn open_scroll(
        &self,
        index: &str,
        query: &TaskQuery,
        page_size: usize,
    ) -> BackendResult<ScrollPage> {
        match self {
            Self::Memory(b) => b.open_scroll(index, query, page_size).await,
            Self::Http(b) => b.open_scroll(index, query, page_size).await,
        }
    }

    async fn scroll(&self, scroll_id: &str) -> BackendResult<ScrollPage> {
        match self {
            Self::Memory(b) => b.scroll(scroll_id).await,
            Self::Http(b) => b.scroll(scroll_id).await,
        }
    }

    async fn clear_scroll(&self, scroll_id: &str) -> BackendResult<()> {
        match self {
            Self::Memory(b) => b.clear_scroll(scroll_id).await,
            Self::Http(b) => b.clear_scroll(scroll_id).await,
        }
    }

    async fn alias_indices(&self, alias: &str) -> BackendResult<Vec<String>> {
        match self {
            Self::Memory(b) => b.alias_indices(alias).await,
            Self::Http(b) => b.alias_indices(alias).await,
        }
    }

    async fn create_index(&self, index: &str, alias: Option<&str>) -> BackendResult<()> {
        match self {
            Self::Memory(b) => b.create_index(index, alias).await,
            Self::Http(b) => b.create_index(index, alias).await,
        }
    }

    async fn put_template(&self, template: &IndexTemplate) -> BackendResult<()> {
        match self {
            Self::Memory(b) => b.put_template(template).await,
            Self::Http(b) => b.put_template(template).await,
        }
    }

    async fn put_script(&self, id: &str, source: &str) -> BackendResult<()> {
        match self {
            Self::Memory(b) => b.put_script(id, source).await,
            Self::Http(b) => b.put_script(id, source).await,
        }
    }

    async fn rollover(
        &self,
        alias: &str,
        conditions: &RolloverConditions,
    ) -> BackendResult<RolloverOutcome> {
        match self {
            Self::Memory(b) => b.rollover(alias, conditions).await,
            Self::Http(b) => b.rollover(alias, conditions).await,
        }
    }

    async fn delete_by_query(
        &self,
        index: &str,
        query: &TaskQuery,
        wait: bool,
    ) -> BackendResult<DeleteByQueryAck> {
        match self {
            Self::Memory(b) => b.delete_by_query(index, query, wait).await,
            Self::Http(b) => b.delete_by_query(index, query, wait).await,
        }
    }
}
