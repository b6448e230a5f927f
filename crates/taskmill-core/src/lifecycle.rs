//! Index lifecycle: write alias, rollover with partial-task migration, and
//! TTL deletion.
//!
//! Every environment writes through the alias `{index_prefix}-{env}`. The
//! first concrete index is `{alias}-000001`; rollover creates the next serial
//! and moves the alias. Tasks still in a partial status are copied into the
//! new index and then deleted from the old one so later events for them keep
//! landing in a single document.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::backend::{
    DeleteByQueryAck, IndexTemplate, MERGE_SCRIPT_ID, RolloverConditions, SearchBackend,
    TaskQuery,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::indexer::BulkIndexer;
use crate::query::TaskQueries;
use crate::retry::{RetryPolicy, with_backend_retry};

/// Stored painless script applied to every upsert.
///
/// Same rules as [`Task::merge_update`](crate::task::Task::merge_update):
/// status is replayed against the stored one so a late partial update never
/// downgrades a finished task, first name and primary id stick, times keep the
/// earliest value, maps are merged key by key and log lines are appended once.
pub const MERGE_SCRIPT_SOURCE: &str = r"
String advance(String s, boolean ended, String kind) {
  if (s == 'UNTERMINATED') { return kind == 'START' ? s : kind; }
  if (s == 'PARTIAL_INFO_ONLY') { return kind == 'START' ? 'UNTERMINATED' : 'PARTIAL_' + kind; }
  if (s == 'PARTIAL_SUCCESS') { return kind == 'START' ? 'SUCCESS' : (kind == 'ERROR' ? 'CORRUPTED' : s); }
  if (s == 'PARTIAL_ERROR' && ended) { return kind == 'START' ? 'ERROR' : (kind == 'SUCCESS' ? 'CORRUPTED' : s); }
  if (s == 'PARTIAL_ERROR') { return kind == 'START' ? s : kind; }
  if (s == 'SUCCESS') { return kind == 'ERROR' ? 'CORRUPTED' : s; }
  if (s == 'ERROR') { return kind == 'SUCCESS' ? 'CORRUPTED' : s; }
  return s;
}
boolean terminal(String s) { return s == 'SUCCESS' || s == 'ERROR' || s == 'CORRUPTED'; }

def src = ctx._source;
def task = params.task;
String stored = src.status;
String update = task.status;
if (stored == null) {
  src.status = update;
} else if (!(task.name == 'LogWithoutContext' && src.name != null)) {
  boolean ended = src.end_time != null;
  if (terminal(update)) {
    src.status = terminal(stored) && stored != update ? 'CORRUPTED' : update;
  } else if (update == 'UNTERMINATED') {
    src.status = advance(stored, ended, 'START');
  } else if (update == 'PARTIAL_SUCCESS') {
    src.status = advance(stored, ended, 'SUCCESS');
  } else if (update == 'PARTIAL_ERROR' && task.end_time != null) {
    src.status = advance(stored, ended, 'ERROR');
  } else if (update == 'PARTIAL_ERROR' && !terminal(stored)) {
    src.status = 'PARTIAL_ERROR';
  }
}
for (entry in task.entrySet()) {
  def key = entry.getKey();
  def value = entry.getValue();
  if (value == null || key == 'status' || key == 'orphan' || key == 'duration_ms') { continue; }
  if (key == 'strings' || key == 'metrics' || key == 'texts' || key == 'ctx') {
    if (src[key] == null) { src[key] = new HashMap(); }
    src[key].putAll(value);
  } else if (key == 'logs') {
    if (src.logs == null) { src.logs = new ArrayList(); }
    for (line in value) { if (!src.logs.contains(line)) { src.logs.add(line); } }
  } else if (key == 'start_time' || key == 'end_time') {
    if (src[key] == null || ZonedDateTime.parse(value).isBefore(ZonedDateTime.parse(src[key]))) { src[key] = value; }
  } else if (key == 'name' || key == 'primary_id' || key == 'date_to_delete') {
    if (src[key] == null) { src[key] = value; }
  } else {
    src[key] = value;
  }
}
src.orphan = task.orphan == true && src.parents_path == null;
if (src.start_time != null && src.end_time != null) {
  long ms = ChronoUnit.MILLIS.between(ZonedDateTime.parse(src.start_time), ZonedDateTime.parse(src.end_time));
  src.duration_ms = Math.max(0L, ms);
}
";

/// Field mapping installed with the index template.
#[must_use]
pub fn default_mappings() -> Value {
    json!({
        "dynamic_templates": [
            { "strings": { "path_match": "strings.*", "mapping": { "type": "keyword" } } },
            { "ctx": { "path_match": "ctx.*", "mapping": { "type": "keyword" } } },
            { "texts": { "path_match": "texts.*", "mapping": { "type": "text" } } },
            { "metrics": { "path_match": "metrics.*", "mapping": { "type": "double" } } }
        ],
        "properties": {
            "id": { "type": "keyword" },
            "name": { "type": "keyword" },
            "status": { "type": "keyword" },
            "parent_id": { "type": "keyword" },
            "primary_id": { "type": "keyword" },
            "parents_path": { "type": "keyword" },
            "env": { "type": "keyword" },
            "orphan": { "type": "boolean" },
            "start_time": { "type": "date" },
            "end_time": { "type": "date" },
            "date_to_delete": { "type": "date" },
            "duration_ms": { "type": "long" },
            "logs": { "type": "text" }
        }
    })
}

/// Lifecycle settings, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub index_prefix: String,
    pub conditions: RolloverConditions,
    pub shards: u32,
    pub replicas: u32,
    pub max_total_fields: u32,
    pub retry: RetryPolicy,
}

impl From<&Config> for LifecycleSettings {
    fn from(config: &Config) -> Self {
        let lifecycle = &config.lifecycle;
        Self {
            index_prefix: lifecycle.index_prefix.clone(),
            conditions: RolloverConditions {
                max_age_days: lifecycle.max_index_age_days,
                max_size_gb: lifecycle.max_index_size_gb,
                max_docs: lifecycle.max_index_docs,
            },
            shards: lifecycle.shards,
            replicas: lifecycle.replicas,
            max_total_fields: lifecycle.max_total_fields,
            retry: RetryPolicy::backend_admin(
                Duration::from_millis(config.backend.backoff_unit_ms),
                config.backend.max_retries,
            ),
        }
    }
}

/// What a rollover did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolloverReport {
    pub old_index: String,
    pub new_index: String,
    pub migration: MigrationReport,
}

/// Result of moving partial tasks between indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Partial tasks found in the old index
    pub found: usize,
    /// Tasks whose copy into the new index failed
    pub failed_copies: usize,
    /// Documents removed from the old index
    pub deleted: u64,
    /// The delete phase was skipped because copies failed
    pub delete_skipped: bool,
}

/// Owns aliases and index turnover for one deployment.
pub struct IndexLifecycle<B> {
    indexer: BulkIndexer<B>,
    queries: TaskQueries<B>,
    settings: LifecycleSettings,
    current: RwLock<HashMap<String, String>>,
}

impl<B: SearchBackend> IndexLifecycle<B> {
    #[must_use]
    pub fn new(indexer: BulkIndexer<B>, queries: TaskQueries<B>, settings: LifecycleSettings) -> Self {
        Self {
            indexer,
            queries,
            settings,
            current: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn alias_for(&self, env: &str) -> String {
        format!("{}-{env}", self.settings.index_prefix)
    }

    /// Index the alias pointed at when last seen.
    #[must_use]
    pub fn current_index(&self, alias: &str) -> Option<String> {
        self.current.read().get(alias).cloned()
    }

    /// Aliases ensured so far, sorted.
    #[must_use]
    pub fn known_aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.current.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    /// Install the index template and the merge script.
    pub async fn bootstrap(&self) -> Result<()> {
        let prefix = &self.settings.index_prefix;
        let template = IndexTemplate {
            name: prefix.clone(),
            index_patterns: vec![format!("{prefix}*")],
            shards: self.settings.shards,
            replicas: self.settings.replicas,
            max_total_fields: self.settings.max_total_fields,
            mappings: default_mappings(),
        };
        let backend = self.indexer.backend();
        let template = &template;
        with_backend_retry(&self.settings.retry, "put_template", || async move {
            backend.put_template(template).await.map_err(Error::from)
        })
        .await?;
        with_backend_retry(&self.settings.retry, "put_script", || async move {
            backend
                .put_script(MERGE_SCRIPT_ID, MERGE_SCRIPT_SOURCE)
                .await
                .map_err(Error::from)
        })
        .await?;
        info!(prefix = %prefix, "Index template and merge script installed");
        Ok(())
    }

    /// Make sure the alias for `env` exists, creating its first index if not.
    ///
    /// Always returns the alias name; a failure is logged and writes will go
    /// to the alias anyway.
    pub async fn ensure_alias(&self, env: &str) -> String {
        let alias = self.alias_for(env);
        let backend = self.indexer.backend();
        let alias_ref = alias.as_str();
        let resolved = with_backend_retry(&self.settings.retry, "ensure_alias", || async move {
            let indices = backend.alias_indices(alias_ref).await.map_err(Error::from)?;
            if let Some(write_index) = indices.last() {
                return Ok(write_index.clone());
            }
            let initial = format!("{alias_ref}-000001");
            backend
                .create_index(&initial, Some(alias_ref))
                .await
                .map_err(Error::from)?;
            info!(alias = alias_ref, index = %initial, "Created initial index");
            Ok(initial)
        })
        .await;

        match resolved {
            Ok(index) => {
                debug!(alias = %alias, index = %index, "Alias ready");
                self.current.write().insert(alias.clone(), index);
            }
            Err(e) => error!(alias = %alias, error = %e, "Failed to ensure alias"),
        }
        alias
    }

    /// Roll the alias over when a threshold is met and migrate partial tasks.
    pub async fn maybe_rollover(&self, alias: &str) -> Result<Option<RolloverReport>> {
        let backend = self.indexer.backend();
        let conditions = &self.settings.conditions;
        let outcome = with_backend_retry(&self.settings.retry, "rollover", || async move {
            backend.rollover(alias, conditions).await.map_err(Error::from)
        })
        .await?;

        if !outcome.rolled_over {
            debug!(alias, index = %outcome.old_index, "Rollover not due");
            return Ok(None);
        }
        info!(
            alias,
            old_index = %outcome.old_index,
            new_index = %outcome.new_index,
            "Index rolled over"
        );
        self.current
            .write()
            .insert(alias.to_string(), outcome.new_index.clone());

        let migration = self
            .migrate_partial_tasks(&outcome.old_index, &outcome.new_index)
            .await?;
        Ok(Some(RolloverReport {
            old_index: outcome.old_index,
            new_index: outcome.new_index,
            migration,
        }))
    }

    /// Copy partial tasks from `old_index` to `new_index`, then delete them
    /// from `old_index`.
    ///
    /// The two phases are not atomic. A crash between them leaves the task in
    /// both indices; lookups prefer the newer copy.
    pub async fn migrate_partial_tasks(
        &self,
        old_index: &str,
        new_index: &str,
    ) -> Result<MigrationReport> {
        let partial = self.queries.index_partial_tasks(old_index).await?;
        if partial.is_empty() {
            return Ok(MigrationReport::default());
        }

        let tasks: BTreeMap<_, _> = partial.into_iter().map(|t| (t.id.clone(), t)).collect();
        let copied = self.indexer.index(&tasks, new_index).await?;
        let mut report = MigrationReport {
            found: tasks.len(),
            failed_copies: copied.failed_operations,
            ..MigrationReport::default()
        };
        if !copied.is_clean() {
            warn!(
                old_index,
                new_index,
                failed = copied.failed_operations,
                "Partial task copy incomplete, keeping originals"
            );
            report.delete_skipped = true;
            return Ok(report);
        }

        let backend = self.indexer.backend();
        let query = TaskQuery::Ids(tasks.into_keys().collect());
        let query = &query;
        let ack = with_backend_retry(&self.settings.retry, "delete_migrated", || async move {
            backend
                .delete_by_query(old_index, query, true)
                .await
                .map_err(Error::from)
        })
        .await?;
        report.deleted = ack.deleted.unwrap_or(0);
        info!(
            old_index,
            new_index,
            migrated = report.found,
            deleted = report.deleted,
            "Partial tasks migrated"
        );
        Ok(report)
    }

    /// Submit deletion of every task past its `date_to_delete`.
    pub async fn delete_expired_tasks(&self) -> Result<DeleteByQueryAck> {
        let backend = self.indexer.backend();
        let pattern = self.queries.search_pattern();
        let query = TaskQuery::ExpiredAt(Utc::now());
        let query = &query;
        let ack = with_backend_retry(&self.settings.retry, "delete_expired", || async move {
            backend
                .delete_by_query(pattern, query, false)
                .await
                .map_err(Error::from)
        })
        .await?;
        info!(pattern, task = ?ack.task, "Expired task deletion submitted");
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::indexer::IndexerSettings;
    use crate::task::{Task, TaskStatus};
    use chrono::Duration as ChronoDuration;

    fn lifecycle(backend: &MemoryBackend) -> IndexLifecycle<MemoryBackend> {
        let mut config = Config::default();
        config.backend.backoff_unit_ms = 1;
        config.backend.max_retries = 1;
        let indexer = BulkIndexer::new(backend.clone(), IndexerSettings::from(&config), None);
        let queries = TaskQueries::from_config(backend.clone(), &config);
        IndexLifecycle::new(indexer, queries, LifecycleSettings::from(&config))
    }

    #[tokio::test]
    async fn ensure_alias_creates_first_index_once() {
        let backend = MemoryBackend::new();
        let lc = lifecycle(&backend);
        let alias = lc.ensure_alias("prod").await;
        assert_eq!(alias, "taskmill-prod");
        assert_eq!(lc.current_index(&alias).as_deref(), Some("taskmill-prod-000001"));

        lc.ensure_alias("prod").await;
        assert_eq!(backend.index_names(), vec!["taskmill-prod-000001".to_string()]);
    }

    #[tokio::test]
    async fn ensure_alias_returns_name_when_backend_is_down() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        let lc = lifecycle(&backend);
        assert_eq!(lc.ensure_alias("dev").await, "taskmill-dev");
        assert!(lc.current_index("taskmill-dev").is_none());
    }

    #[tokio::test]
    async fn bootstrap_installs_template_and_script() {
        let backend = MemoryBackend::new();
        lifecycle(&backend).bootstrap().await.unwrap();
        assert!(backend.has_template("taskmill"));
        assert_eq!(backend.script(MERGE_SCRIPT_ID).as_deref(), Some(MERGE_SCRIPT_SOURCE));
    }

    #[tokio::test]
    async fn bootstrap_failure_is_an_error() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        assert!(lifecycle(&backend).bootstrap().await.is_err());
    }

    #[tokio::test]
    async fn rollover_not_due_is_a_no_op() {
        let backend = MemoryBackend::new();
        let lc = lifecycle(&backend);
        let alias = lc.ensure_alias("prod").await;
        assert!(lc.maybe_rollover(&alias).await.unwrap().is_none());
        assert_eq!(lc.current_index(&alias).as_deref(), Some("taskmill-prod-000001"));
    }

    #[tokio::test]
    async fn rollover_moves_partial_tasks_only() {
        let backend = MemoryBackend::new();
        let lc = lifecycle(&backend);
        let alias = lc.ensure_alias("prod").await;
        backend.insert_document(&alias, Task::new("open", TaskStatus::Unterminated));
        backend.insert_document(&alias, Task::new("done", TaskStatus::Success));

        backend.force_next_rollover();
        let report = lc.maybe_rollover(&alias).await.unwrap().unwrap();
        assert_eq!(report.new_index, "taskmill-prod-000002");
        assert_eq!(report.migration.found, 1);
        assert_eq!(report.migration.deleted, 1);

        assert!(backend.document("taskmill-prod-000002", "open").is_some());
        assert!(backend.document("taskmill-prod-000001", "open").is_none());
        assert!(backend.document("taskmill-prod-000001", "done").is_some());
        assert_eq!(lc.current_index(&alias).as_deref(), Some("taskmill-prod-000002"));
    }

    #[tokio::test]
    async fn failed_copy_keeps_originals() {
        let backend = MemoryBackend::new();
        let lc = lifecycle(&backend);
        let alias = lc.ensure_alias("prod").await;
        backend.insert_document(&alias, Task::new("open", TaskStatus::PartialError));
        backend.fail_ids(["open"]);

        backend.force_next_rollover();
        let report = lc.maybe_rollover(&alias).await.unwrap().unwrap();
        assert!(report.migration.delete_skipped);
        assert_eq!(report.migration.failed_copies, 1);
        assert!(backend.document("taskmill-prod-000001", "open").is_some());
    }

    #[tokio::test]
    async fn expired_tasks_are_deleted_across_indices() {
        let backend = MemoryBackend::new();
        let lc = lifecycle(&backend);
        let mut expired = Task::new("old", TaskStatus::Success);
        expired.date_to_delete = Some(Utc::now() - ChronoDuration::days(1));
        let mut fresh = Task::new("new", TaskStatus::Success);
        fresh.date_to_delete = Some(Utc::now() + ChronoDuration::days(1));
        backend.insert_document("taskmill-a-000001", expired);
        backend.insert_document("taskmill-b-000001", fresh);
        backend.insert_document("other-000001", {
            let mut t = Task::new("foreign", TaskStatus::Success);
            t.date_to_delete = Some(Utc::now() - ChronoDuration::days(1));
            t
        });

        let ack = lc.delete_expired_tasks().await.unwrap();
        assert!(ack.task.is_some());
        assert!(backend.document("taskmill-a-000001", "old").is_none());
        assert!(backend.document("taskmill-b-000001", "new").is_some());
        assert!(backend.document("other-000001", "foreign").is_some());
    }
}
