//! In-process backend.
//!
//! Mirrors the behaviour the pipeline relies on from a real cluster: aliases
//! with a write index, auto-created indices on bulk, merge-on-upsert, paged
//! scrolls and rollover by document count or age. Failures can be injected
//! for the whole backend, for the next N bulk calls, or per document id.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use super::{
    BackendResult, DeleteByQueryAck, IndexTemplate, RolloverConditions, RolloverOutcome,
    ScrollPage, SearchBackend, SearchHit, TaskQuery, next_rollover_name,
};
use crate::bulk::{BulkItemResult, BulkResponse, UpsertOperation};
use crate::error::BackendError;
use crate::task::Task;

#[derive(Debug)]
struct MemoryIndex {
    created_at: DateTime<Utc>,
    docs: BTreeMap<String, Task>,
}

impl MemoryIndex {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            docs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    indices: BTreeMap<String, MemoryIndex>,
    /// alias -> indices, write index last
    aliases: HashMap<String, Vec<String>>,
    templates: BTreeMap<String, IndexTemplate>,
    scripts: BTreeMap<String, String>,
    scrolls: HashMap<String, VecDeque<SearchHit>>,
    next_scroll: u64,
    page_sizes: HashMap<String, usize>,
    unavailable: bool,
    fail_next_bulks: u32,
    failing_ids: BTreeSet<String>,
    force_rollover: bool,
}

impl MemoryState {
    fn check_available(&self) -> BackendResult<()> {
        if self.unavailable {
            Err(BackendError::Transport("memory backend marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// Resolve an alias, concrete name or trailing-`*` pattern to indices.
    fn resolve(&self, target: &str) -> Vec<String> {
        if let Some(prefix) = target.strip_suffix('*') {
            return self
                .indices
                .keys()
                .filter(|name| name.starts_with(prefix))
                .cloned()
                .collect();
        }
        if let Some(indices) = self.aliases.get(target) {
            return indices.clone();
        }
        if self.indices.contains_key(target) {
            return vec![target.to_string()];
        }
        Vec::new()
    }

    fn write_index(&self, target: &str) -> String {
        self.aliases
            .get(target)
            .and_then(|indices| indices.last().cloned())
            .unwrap_or_else(|| target.to_string())
    }

    fn open_page(&mut self, hits: Vec<SearchHit>, page_size: usize) -> ScrollPage {
        self.next_scroll += 1;
        let scroll_id = format!("scroll-{}", self.next_scroll);
        self.page_sizes.insert(scroll_id.clone(), page_size.max(1));
        self.scrolls.insert(scroll_id.clone(), hits.into());
        self.take_page(&scroll_id)
    }

    fn take_page(&mut self, scroll_id: &str) -> ScrollPage {
        let page_size = self.page_sizes.get(scroll_id).copied().unwrap_or(1);
        let hits = match self.scrolls.get_mut(scroll_id) {
            Some(queue) => {
                let n = page_size.min(queue.len());
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        };
        ScrollPage {
            scroll_id: Some(scroll_id.to_string()),
            hits,
        }
    }
}

/// In-process search backend, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    bulk_calls: Arc<AtomicU64>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with a transport error until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    /// Fail the next `n` bulk calls with a transport error.
    pub fn fail_next_bulks(&self, n: u32) {
        self.state.lock().fail_next_bulks = n;
    }

    /// Reject upserts of these ids with a per-item 429 until cleared.
    pub fn fail_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .failing_ids
            .extend(ids.into_iter().map(Into::into));
    }

    pub fn clear_failing_ids(&self) {
        self.state.lock().failing_ids.clear();
    }

    /// Make the next rollover happen regardless of thresholds.
    pub fn force_next_rollover(&self) {
        self.state.lock().force_rollover = true;
    }

    #[must_use]
    pub fn bulk_calls(&self) -> u64 {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Stored copy of `id` in a concrete index.
    #[must_use]
    pub fn document(&self, index: &str, id: &str) -> Option<Task> {
        self.state
            .lock()
            .indices
            .get(index)
            .and_then(|idx| idx.docs.get(id).cloned())
    }

    /// Insert a document directly, bypassing the bulk path.
    pub fn insert_document(&self, index: &str, task: Task) {
        let mut state = self.state.lock();
        let target = state.write_index(index);
        state
            .indices
            .entry(target)
            .or_insert_with(MemoryIndex::new)
            .docs
            .insert(task.id.clone(), task);
    }

    #[must_use]
    pub fn doc_count(&self, index: &str) -> usize {
        let state = self.state.lock();
        state
            .resolve(index)
            .iter()
            .filter_map(|name| state.indices.get(name))
            .map(|idx| idx.docs.len())
            .sum()
    }

    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.state.lock().indices.keys().cloned().collect()
    }

    #[must_use]
    pub fn has_template(&self, name: &str) -> bool {
        self.state.lock().templates.contains_key(name)
    }

    #[must_use]
    pub fn script(&self, id: &str) -> Option<String> {
        self.state.lock().scripts.get(id).cloned()
    }

    #[must_use]
    pub fn open_scrolls(&self) -> usize {
        self.state.lock().scrolls.len()
    }
}

impl SearchBackend for MemoryBackend {
    async fn bulk(&self, operations: &[UpsertOperation]) -> BackendResult<BulkResponse> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.check_available()?;
        if state.fail_next_bulks > 0 {
            state.fail_next_bulks -= 1;
            return Err(BackendError::Transport("injected bulk failure".into()));
        }

        let mut items = Vec::with_capacity(operations.len());
        for op in operations {
            if state.failing_ids.contains(&op.id) {
                items.push(BulkItemResult::failed(
                    op.id.clone(),
                    429,
                    "es_rejected_execution_exception",
                ));
                continue;
            }
            let target = state.write_index(&op.index);
            let index = state.indices.entry(target).or_insert_with(MemoryIndex::new);
            match index.docs.get_mut(&op.id) {
                Some(stored) => stored.merge_update(&op.task),
                None => {
                    index.docs.insert(op.id.clone(), op.task.clone());
                }
            }
            items.push(BulkItemResult::ok(op.id.clone()));
        }
        Ok(BulkResponse { items })
    }

    async fn open_scroll(
        &self,
        index: &str,
        query: &TaskQuery,
        page_size: usize,
    ) -> BackendResult<ScrollPage> {
        let mut state = self.state.lock();
        state.check_available()?;
        let mut hits = Vec::new();
        for name in state.resolve(index) {
            if let Some(idx) = state.indices.get(&name) {
                hits.extend(idx.docs.values().filter(|t| query.matches(t)).map(|t| {
                    SearchHit {
                        index: name.clone(),
                        task: t.clone(),
                    }
                }));
            }
        }
        Ok(state.open_page(hits, page_size))
    }

    async fn scroll(&self, scroll_id: &str) -> BackendResult<ScrollPage> {
        let mut state = self.state.lock();
        state.check_available()?;
        if !state.scrolls.contains_key(scroll_id) {
            return Err(BackendError::NotFound(format!("scroll {scroll_id}")));
        }
        Ok(state.take_page(scroll_id))
    }

    async fn clear_scroll(&self, scroll_id: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.scrolls.remove(scroll_id);
        state.page_sizes.remove(scroll_id);
        Ok(())
    }

    async fn alias_indices(&self, alias: &str) -> BackendResult<Vec<String>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.aliases.get(alias).cloned().unwrap_or_default())
    }

    async fn create_index(&self, index: &str, alias: Option<&str>) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.indices.contains_key(index) {
            return Err(BackendError::Status {
                status: 400,
                body: format!("resource_already_exists_exception: {index}"),
            });
        }
        state.indices.insert(index.to_string(), MemoryIndex::new());
        if let Some(alias) = alias {
            state
                .aliases
                .entry(alias.to_string())
                .or_default()
                .push(index.to_string());
        }
        Ok(())
    }

    async fn put_template(&self, template: &IndexTemplate) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state
            .templates
            .insert(template.name.clone(), template.clone());
        Ok(())
    }

    async fn put_script(&self, id: &str, source: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.scripts.insert(id.to_string(), source.to_string());
        Ok(())
    }

    async fn rollover(
        &self,
        alias: &str,
        conditions: &RolloverConditions,
    ) -> BackendResult<RolloverOutcome> {
        let mut state = self.state.lock();
        state.check_available()?;
        let Some(old_index) = state.aliases.get(alias).and_then(|v| v.last().cloned()) else {
            return Err(BackendError::NotFound(format!("alias {alias}")));
        };
        let (docs, age) = state.indices.get(&old_index).map_or((0, ChronoDuration::zero()), |idx| {
            (idx.docs.len() as u64, Utc::now() - idx.created_at)
        });

        let due = std::mem::take(&mut state.force_rollover)
            || docs >= conditions.max_docs
            || age >= ChronoDuration::days(i64::from(conditions.max_age_days));
        let new_index = next_rollover_name(&old_index);
        if !due {
            return Ok(RolloverOutcome {
                rolled_over: false,
                old_index,
                new_index,
            });
        }

        state.indices.insert(new_index.clone(), MemoryIndex::new());
        state
            .aliases
            .entry(alias.to_string())
            .or_default()
            .push(new_index.clone());
        Ok(RolloverOutcome {
            rolled_over: true,
            old_index,
            new_index,
        })
    }

    async fn delete_by_query(
        &self,
        index: &str,
        query: &TaskQuery,
        wait: bool,
    ) -> BackendResult<DeleteByQueryAck> {
        let mut state = self.state.lock();
        state.check_available()?;
        let mut deleted = 0u64;
        for name in state.resolve(index) {
            if let Some(idx) = state.indices.get_mut(&name) {
                let before = idx.docs.len();
                idx.docs.retain(|_, task| !query.matches(task));
                deleted += (before - idx.docs.len()) as u64;
            }
        }
        Ok(if wait {
            DeleteByQueryAck {
                task: None,
                deleted: Some(deleted),
            }
        } else {
            DeleteByQueryAck {
                task: Some(format!("memory:{}", state.next_scroll)),
                deleted: None,
            }
        })
    }
}
