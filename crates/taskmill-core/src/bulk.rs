//! Bulk write operations and batches.
//!
//! A [`BulkBatch`] is the unit of delivery. It carries its own redelivery
//! bookkeeping (`times_fetched`, `insert_time`, `queue_id`) so a batch pulled
//! from the failure queue can be routed by the same rules as a fresh one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Fixed per-operation overhead of the action line in a bulk body.
const ACTION_LINE_BYTES: usize = 64;

/// Partial-document upsert of one task into one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertOperation {
    pub index: String,
    pub id: String,
    pub task: Task,
}

impl UpsertOperation {
    #[must_use]
    pub fn new(index: impl Into<String>, task: Task) -> Self {
        Self {
            index: index.into(),
            id: task.id.clone(),
            task,
        }
    }

    /// Approximate size of this operation in a bulk request body.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        let doc = serde_json::to_vec(&self.task).map_or(0, |v| v.len());
        // The document travels twice: as script params and as upsert body.
        ACTION_LINE_BYTES + self.index.len() + self.id.len() + doc * 2
    }
}

/// Group of operations delivered in one bulk request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkBatch {
    pub operations: Vec<UpsertOperation>,
    /// Times this batch has been pulled from the failure queue
    pub times_fetched: u32,
    /// When the batch was first written to the failure queue
    pub insert_time: Option<DateTime<Utc>>,
    /// Row id while the batch lives in the failure queue
    pub queue_id: Option<i64>,
}

impl BulkBatch {
    #[must_use]
    pub fn new(operations: Vec<UpsertOperation>) -> Self {
        Self {
            operations,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    #[must_use]
    pub fn estimated_size(&self) -> usize {
        self.operations.iter().map(UpsertOperation::estimated_size).sum()
    }

    /// New batch holding only the operations the backend reported as failed.
    ///
    /// Items are matched by position; an operation with no matching item
    /// counts as failed. Bookkeeping fields carry over.
    #[must_use]
    pub fn failed_subset(&self, response: &BulkResponse) -> Self {
        let operations = self
            .operations
            .iter()
            .enumerate()
            .filter(|(i, _)| response.items.get(*i).is_none_or(BulkItemResult::is_failure))
            .map(|(_, op)| op.clone())
            .collect();
        Self {
            operations,
            times_fetched: self.times_fetched,
            insert_time: self.insert_time,
            queue_id: self.queue_id,
        }
    }
}

/// Per-item result of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemResult {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub error: Option<String>,
}

impl BulkItemResult {
    #[must_use]
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: 200,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(id: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.status >= 300
    }
}

/// Response to a bulk request, one item per operation in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.items.iter().any(BulkItemResult::is_failure)
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_failure()).count()
    }

    /// First failure message, for logging.
    #[must_use]
    pub fn first_failure(&self) -> Option<&str> {
        self.items
            .iter()
            .find(|i| i.is_failure())
            .and_then(|i| i.error.as_deref())
    }
}

/// Build one upsert per task and cut them into size-bounded batches.
///
/// A batch closes as soon as its estimated size exceeds `max_bytes`; the last
/// partial batch is always returned.
#[must_use]
pub fn build_batches(
    tasks: &BTreeMap<String, Task>,
    index: &str,
    max_bytes: usize,
) -> Vec<BulkBatch> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;

    for task in tasks.values() {
        let op = UpsertOperation::new(index, task.clone());
        current_bytes += op.estimated_size();
        current.push(op);
        if current_bytes > max_bytes {
            batches.push(BulkBatch::new(std::mem::take(&mut current)));
            current_bytes = 0;
        }
    }
    if !current.is_empty() {
        batches.push(BulkBatch::new(current));
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    fn tasks(n: usize) -> BTreeMap<String, Task> {
        (0..n)
            .map(|i| {
                let id = format!("task-{i:03}");
                (id.clone(), Task::new(id, TaskStatus::Unterminated))
            })
            .collect()
    }

    #[test]
    fn small_input_fits_one_batch() {
        let batches = build_batches(&tasks(5), "idx", 1024 * 1024);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
        assert!(batches[0].operations.iter().all(|op| op.index == "idx"));
    }

    #[test]
    fn batch_closes_after_exceeding_threshold() {
        let input = tasks(10);
        let one = UpsertOperation::new("idx", input["task-000"].clone()).estimated_size();
        // Two operations stay under the limit, the third pushes it over.
        let batches = build_batches(&input, "idx", one * 2 + 1);
        assert_eq!(batches.iter().map(BulkBatch::len).collect::<Vec<_>>(), vec![3, 3, 3, 1]);
    }

    #[test]
    fn every_task_lands_in_exactly_one_batch() {
        let input = tasks(37);
        let batches = build_batches(&input, "idx", 700);
        let mut ids: Vec<_> = batches
            .iter()
            .flat_map(|b| b.operations.iter().map(|op| op.id.clone()))
            .collect();
        ids.sort();
        assert_eq!(ids, input.keys().cloned().collect::<Vec<_>>());
    }

    #[test]
    fn empty_input_has_no_batches() {
        assert!(build_batches(&BTreeMap::new(), "idx", 10).is_empty());
    }

    #[test]
    fn failed_subset_keeps_only_failures_and_bookkeeping() {
        let mut batch = build_batches(&tasks(4), "idx", usize::MAX).remove(0);
        batch.times_fetched = 2;
        batch.queue_id = Some(9);
        let response = BulkResponse {
            items: vec![
                BulkItemResult::ok("task-000"),
                BulkItemResult::failed("task-001", 429, "rejected"),
                BulkItemResult::ok("task-002"),
                BulkItemResult::failed("task-003", 500, "boom"),
            ],
        };
        assert!(response.has_failures());
        assert_eq!(response.failure_count(), 2);
        assert_eq!(response.first_failure(), Some("rejected"));

        let failed = batch.failed_subset(&response);
        let ids: Vec<_> = failed.operations.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["task-001", "task-003"]);
        assert_eq!(failed.times_fetched, 2);
        assert_eq!(failed.queue_id, Some(9));
    }

    #[test]
    fn operations_missing_from_short_response_count_as_failed() {
        let batch = build_batches(&tasks(3), "idx", usize::MAX).remove(0);
        let response = BulkResponse {
            items: vec![BulkItemResult::ok("task-000")],
        };
        assert!(!response.has_failures());

        let failed = batch.failed_subset(&response);
        let ids: Vec<_> = failed.operations.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["task-001", "task-002"]);

        let empty = batch.failed_subset(&BulkResponse::default());
        assert_eq!(empty.len(), 3);
    }

    #[test]
    fn status_alone_marks_failure() {
        let item = BulkItemResult {
            id: "a".into(),
            status: 409,
            error: None,
        };
        assert!(item.is_failure());
        assert!(!BulkItemResult::ok("a").is_failure());
    }
}
