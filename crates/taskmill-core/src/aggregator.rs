//! Per-task aggregation state machine with orphan adoption.
//!
//! The aggregator keeps two indexes:
//!
//! - `tasks`: task id to its current aggregate
//! - `pending_orphans`: parent id to the children waiting on it
//!
//! A child whose parent is unknown, or whose parent is itself an orphan, is
//! flagged `orphan` and parked under its parent id. When that parent becomes
//! known and anchored, an [`AdoptedEvent`] is applied to every parked child
//! and the walk continues breadth first through their own parked children.
//!
//! Every changed task is marked dirty; [`TaskAggregator::drain_dirty`] hands
//! the snapshots to the indexing pipeline. Once flushed, finished tasks and
//! orphans parked longer than `orphan_max_age_secs` leave memory; the backend
//! copy is seeded back when a later event names them.

use std::backtrace::Backtrace;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::task::{
    Event, EventKind, LOG_WITHOUT_CONTEXT, MergeSettings, STACK_TRACE_FIELD, Task, TaskStatus,
};

/// Lineage update for a former orphan whose ancestor became known.
///
/// Never changes status; only ancestry, primary id and inherited context.
#[derive(Debug, Clone, PartialEq)]
pub struct AdoptedEvent {
    pub task_id: String,
    pub parent_id: String,
    pub parents_path: Vec<String>,
    pub primary_id: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl AdoptedEvent {
    fn from_parent(child_id: &str, parent: &Task) -> Self {
        Self {
            task_id: child_id.to_string(),
            parent_id: parent.id.clone(),
            parents_path: parent.path_for_children(),
            primary_id: parent.primary_id.clone(),
            context: parent.ctx.clone(),
        }
    }

    /// Rewrite the child's ancestry in place.
    pub fn apply(&self, task: &mut Task) {
        task.orphan = false;
        task.parent_id = Some(self.parent_id.clone());
        task.parents_path = Some(self.parents_path.clone());
        if task.primary_id.is_none() {
            task.primary_id.clone_from(&self.primary_id);
        }
        inherit_context(task, &self.context);
    }
}

fn inherit_context(task: &mut Task, parent_ctx: &BTreeMap<String, String>) {
    for (key, value) in parent_ctx {
        task.ctx.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Counts describing aggregator memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct AggregatorStats {
    pub resident_tasks: usize,
    pub orphans: usize,
    pub awaited_parents: usize,
    pub dirty: usize,
}

/// In-memory aggregate state for all tasks seen since the last eviction.
#[derive(Debug, Default)]
pub struct TaskAggregator {
    settings: MergeSettings,
    default_env: Option<String>,
    tasks: HashMap<String, Task>,
    pending_orphans: HashMap<String, BTreeSet<String>>,
    parked_at: HashMap<String, DateTime<Utc>>,
    dirty: BTreeSet<String>,
}

impl TaskAggregator {
    #[must_use]
    pub fn new(settings: MergeSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Env stamped on tasks whose events never carry one.
    #[must_use]
    pub fn with_default_env(mut self, env: impl Into<String>) -> Self {
        self.default_env = Some(env.into());
        self
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    #[must_use]
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            resident_tasks: self.tasks.len(),
            orphans: self.tasks.values().filter(|t| t.orphan).count(),
            awaited_parents: self.pending_orphans.len(),
            dirty: self.dirty.len(),
        }
    }

    /// Task and parent ids referenced by `events` that are not resident.
    ///
    /// These may exist in the backend from an earlier flush and must be
    /// seeded before the events are folded.
    #[must_use]
    pub fn unresolved_ids(&self, events: &[Event]) -> Vec<String> {
        let mut unresolved = BTreeSet::new();
        for event in events {
            let ids = std::iter::once(event.task_id.as_str()).chain(event.parent());
            for id in ids {
                if !id.trim().is_empty() && !self.tasks.contains_key(id) {
                    unresolved.insert(id.to_string());
                }
            }
        }
        unresolved.into_iter().collect()
    }

    /// Make an already indexed task resident again.
    ///
    /// Seeded tasks are not dirty unless seeding adopts them. A seeded orphan
    /// is adopted at once when its parent is resident and anchored, otherwise
    /// it is parked under its parent like any other orphan.
    pub fn seed_indexed(&mut self, mut task: Task) {
        if self.tasks.contains_key(&task.id) {
            return;
        }
        let id = task.id.clone();
        let mut adopted_failure = false;

        let parent_id = task
            .parent_id
            .clone()
            .filter(|p| task.orphan && !p.trim().is_empty());
        if let Some(parent_id) = parent_id {
            let adoption = match self.tasks.get(&parent_id) {
                Some(parent) if !parent.orphan => Some(AdoptedEvent::from_parent(&id, parent)),
                _ => None,
            };
            match adoption {
                Some(adoption) => {
                    adoption.apply(&mut task);
                    adopted_failure =
                        matches!(task.status, TaskStatus::Error | TaskStatus::PartialError);
                    debug!(task_id = %id, parent_id = %parent_id, "Seeded orphan adopted");
                    self.dirty.insert(id.clone());
                }
                None => self.park_orphan(&parent_id, &id),
            }
        }

        self.tasks.insert(id.clone(), task);
        if adopted_failure {
            self.propagate_failure(&id);
        }
        self.adopt_waiting(&id);
    }

    /// Fold one event into its task and return the updated snapshot.
    ///
    /// Never fails: unattachable input degrades to a CORRUPTED task.
    pub fn ingest(&mut self, mut event: Event) -> Task {
        if event.task_id.trim().is_empty() {
            event.task_id = Uuid::new_v4().to_string();
            warn!(task_id = %event.task_id, "Event without task id recorded as corrupted");
            return self.record_corrupted(event);
        }

        let existing = self.tasks.get(&event.task_id);
        if existing.is_none()
            && event.kind == EventKind::Info
            && event.display_name().is_none()
            && event.parent().is_none()
        {
            warn!(task_id = %event.task_id, "Info event without name or parent recorded as corrupted");
            return self.record_corrupted(event);
        }

        let current = existing.map(|t| t.status);
        let mut task = existing
            .cloned()
            .unwrap_or_else(|| Task::new(event.task_id.clone(), TaskStatus::Unterminated));

        if task.primary_id.is_none() {
            task.primary_id.clone_from(&event.primary_id);
        }
        if current.is_none() || (task.parent_id.is_none() && event.parent().is_some()) {
            self.attach_lineage(&mut task, &event);
        }

        task.apply_transition(current, &event, &self.settings);
        task.merge_payload(&event, &self.settings);
        self.stamp_env(&mut task);

        let failed_now = matches!(task.status, TaskStatus::Error | TaskStatus::PartialError)
            && current != Some(task.status);

        let id = task.id.clone();
        self.tasks.insert(id.clone(), task);
        self.dirty.insert(id.clone());

        if failed_now {
            self.propagate_failure(&id);
        }
        self.adopt_waiting(&id);

        self.tasks
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Task::new(id, TaskStatus::Corrupted))
    }

    /// Resolve parent, path, primary id and inherited context for `task`.
    fn attach_lineage(&mut self, task: &mut Task, event: &Event) {
        let Some(parent_id) = event.parent() else {
            if task.primary_id.is_none() && matches!(event.kind, EventKind::Start | EventKind::Spot)
            {
                task.primary_id = Some(task.id.clone());
            }
            return;
        };

        task.parent_id = Some(parent_id.to_string());
        match self.tasks.get(parent_id) {
            Some(parent) if !parent.orphan => {
                task.orphan = false;
                task.parents_path = Some(parent.path_for_children());
                if task.primary_id.is_none() {
                    task.primary_id.clone_from(&parent.primary_id);
                }
                inherit_context(task, &parent.ctx);
            }
            Some(parent) => {
                // Parent is resident but unanchored; wait for it to be adopted.
                task.orphan = true;
                if task.primary_id.is_none() {
                    task.primary_id.clone_from(&parent.primary_id);
                }
                inherit_context(task, &parent.ctx);
                self.park_orphan(parent_id, &task.id);
            }
            None => {
                task.orphan = true;
                self.park_orphan(parent_id, &task.id);
            }
        }
    }

    fn park_orphan(&mut self, parent_id: &str, child_id: &str) {
        debug!(task_id = child_id, parent_id, "Task parked as orphan");
        self.pending_orphans
            .entry(parent_id.to_string())
            .or_default()
            .insert(child_id.to_string());
        self.parked_at
            .entry(child_id.to_string())
            .or_insert_with(Utc::now);
    }

    /// Adopt every orphan waiting on `root_id`, transitively.
    fn adopt_waiting(&mut self, root_id: &str) {
        let mut queue = VecDeque::from([root_id.to_string()]);
        let mut visited = HashSet::new();
        let mut adopted_failures = Vec::new();

        while let Some(parent_id) = queue.pop_front() {
            if !visited.insert(parent_id.clone()) {
                continue;
            }
            let Some(parent) = self.tasks.get(&parent_id) else {
                continue;
            };
            if parent.orphan || !self.pending_orphans.contains_key(&parent_id) {
                continue;
            }
            let parent = parent.clone();
            let children = self.pending_orphans.remove(&parent_id).unwrap_or_default();

            for child_id in children {
                let Some(child) = self.tasks.get_mut(&child_id) else {
                    continue;
                };
                AdoptedEvent::from_parent(&child_id, &parent).apply(child);
                self.parked_at.remove(&child_id);
                if matches!(child.status, TaskStatus::Error | TaskStatus::PartialError) {
                    adopted_failures.push(child_id.clone());
                }
                debug!(task_id = %child_id, parent_id = %parent_id, "Orphan adopted");
                self.dirty.insert(child_id.clone());
                queue.push_back(child_id);
            }
        }

        for child_id in adopted_failures {
            self.propagate_failure(&child_id);
        }
    }

    /// Mark UNTERMINATED ancestors of a failed task as PARTIAL_ERROR.
    fn propagate_failure(&mut self, failed_id: &str) {
        let mut visited = HashSet::from([failed_id.to_string()]);
        let mut next = self
            .tasks
            .get(failed_id)
            .and_then(|t| t.parent_id.clone());

        while let Some(ancestor_id) = next.take() {
            if !visited.insert(ancestor_id.clone()) {
                break;
            }
            let Some(ancestor) = self.tasks.get_mut(&ancestor_id) else {
                break;
            };
            if ancestor.status == TaskStatus::Unterminated {
                ancestor.status = TaskStatus::PartialError;
                self.dirty.insert(ancestor_id.clone());
            }
            next.clone_from(&ancestor.parent_id);
        }
    }

    fn record_corrupted(&mut self, event: Event) -> Task {
        let mut task = self
            .tasks
            .get(&event.task_id)
            .cloned()
            .unwrap_or_else(|| {
                let mut task = Task::new(event.task_id.clone(), TaskStatus::Corrupted);
                task.name = Some(LOG_WITHOUT_CONTEXT.to_string());
                task.texts.insert(
                    STACK_TRACE_FIELD.to_string(),
                    Backtrace::force_capture().to_string(),
                );
                task
            });
        task.parent_id = event.parent().map(str::to_string);
        task.apply_transition(Some(TaskStatus::Corrupted), &event, &self.settings);
        task.merge_payload(&event, &self.settings);
        self.stamp_env(&mut task);

        let id = task.id.clone();
        self.tasks.insert(id.clone(), task.clone());
        self.dirty.insert(id);
        task
    }

    fn stamp_env(&self, task: &mut Task) {
        if task.env.is_none() {
            task.env.clone_from(&self.default_env);
        }
    }

    /// Take snapshots of every task changed since the last drain.
    pub fn drain_dirty(&mut self) -> BTreeMap<String, Task> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|id| self.tasks.get(&id).map(|t| (id, t.clone())))
            .collect()
    }

    /// Drop flushed tasks nobody is waiting on. Returns how many were evicted.
    ///
    /// Finished tasks go as soon as they are flushed. Orphans go once they
    /// have been parked for `orphan_max_age_secs` and their parent is not
    /// resident; children parked under an evicted orphan follow on the next
    /// pass.
    pub fn evict_completed(&mut self) -> usize {
        let before = self.tasks.len();
        let pending = &self.pending_orphans;
        let dirty = &self.dirty;
        self.tasks.retain(|id, task| {
            !(task.status.is_terminal()
                && !task.orphan
                && !pending.contains_key(id)
                && !dirty.contains(id))
        });

        let max_age = i64::try_from(self.settings.orphan_max_age_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        loop {
            let stale: Vec<(String, Option<String>)> = self
                .tasks
                .values()
                .filter(|task| {
                    task.orphan
                        && !self.dirty.contains(&task.id)
                        && task
                            .parent_id
                            .as_deref()
                            .is_none_or(|p| !self.tasks.contains_key(p))
                        && self
                            .parked_at
                            .get(&task.id)
                            .is_none_or(|at| now.signed_duration_since(*at) >= max_age)
                })
                .map(|task| (task.id.clone(), task.parent_id.clone()))
                .collect();
            if stale.is_empty() {
                break;
            }
            for (id, parent_id) in stale {
                self.tasks.remove(&id);
                self.parked_at.remove(&id);
                let Some(parent_id) = parent_id else { continue };
                if let Some(waiting) = self.pending_orphans.get_mut(&parent_id) {
                    waiting.remove(&id);
                    if waiting.is_empty() {
                        self.pending_orphans.remove(&parent_id);
                    }
                }
            }
        }

        let evicted = before - self.tasks.len();
        if evicted > 0 {
            debug!(evicted, resident = self.tasks.len(), "Evicted flushed tasks");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn agg() -> TaskAggregator {
        TaskAggregator::new(MergeSettings::default())
    }

    #[test]
    fn root_task_gets_own_primary_id_and_no_path() {
        let mut agg = agg();
        let task = agg.ingest(Event::start("T1", "T1", t(0)));
        assert_eq!(task.primary_id.as_deref(), Some("T1"));
        assert!(task.parents_path.is_none());
        assert!(!task.orphan);
        let task = agg.ingest(Event::success("T1", t(1)));
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.duration_ms.unwrap() >= 0);
    }

    #[test]
    fn child_inherits_primary_path_and_context() {
        let mut agg = agg();
        agg.ingest(Event::start("root", "root", t(0)).with_context("req", "42"));
        let child = agg.ingest(
            Event::start("c", "child", t(1))
                .with_parent("root")
                .with_context("own", "x"),
        );
        assert_eq!(child.primary_id.as_deref(), Some("root"));
        assert_eq!(child.parents_path, Some(vec!["root".to_string()]));
        assert_eq!(child.ctx["req"], "42");
        assert_eq!(child.ctx["own"], "x");
    }

    #[test]
    fn orphan_is_adopted_when_parent_arrives() {
        let mut agg = agg();
        let child = agg.ingest(Event::start("T2", "T2", t(1)).with_parent("T1"));
        assert!(child.orphan);
        assert!(child.parents_path.is_none());
        assert!(child.primary_id.is_none());

        agg.ingest(Event::start("T1", "T1", t(0)));
        let child = agg.get("T2").unwrap();
        assert!(!child.orphan);
        assert_eq!(child.parents_path, Some(vec!["T1".to_string()]));
        assert_eq!(child.primary_id.as_deref(), Some("T1"));
        assert_eq!(agg.stats().awaited_parents, 0);
    }

    #[test]
    fn adoption_cascades_to_grandchildren() {
        let mut agg = agg();
        agg.ingest(Event::start("C", "c", t(1)).with_parent("P"));
        let grandchild = agg.ingest(Event::start("G", "g", t(2)).with_parent("C"));
        assert!(grandchild.orphan);

        agg.ingest(Event::start("P", "p", t(0)).with_context("team", "infra"));
        let c = agg.get("C").unwrap();
        let g = agg.get("G").unwrap();
        assert!(!c.orphan);
        assert!(!g.orphan);
        assert_eq!(g.parents_path, Some(vec!["p".to_string(), "c".to_string()]));
        assert_eq!(g.primary_id.as_deref(), Some("P"));
        assert_eq!(g.ctx["team"], "infra");
    }

    #[test]
    fn adoption_marks_children_dirty() {
        let mut agg = agg();
        agg.ingest(Event::start("C", "c", t(1)).with_parent("P"));
        agg.drain_dirty();
        agg.ingest(Event::start("P", "p", t(0)));
        let dirty = agg.drain_dirty();
        assert!(dirty.contains_key("P"));
        assert!(dirty.contains_key("C"));
    }

    #[test]
    fn child_error_marks_unterminated_ancestors() {
        let mut agg = agg();
        agg.ingest(Event::start("A", "a", t(0)));
        agg.ingest(Event::start("B", "b", t(1)).with_parent("A"));
        agg.ingest(Event::start("C", "c", t(2)).with_parent("B"));
        agg.drain_dirty();
        agg.ingest(Event::error("C", t(3)));
        assert_eq!(agg.get("C").unwrap().status, TaskStatus::Error);
        assert_eq!(agg.get("B").unwrap().status, TaskStatus::PartialError);
        assert_eq!(agg.get("A").unwrap().status, TaskStatus::PartialError);
        let dirty = agg.drain_dirty();
        assert_eq!(dirty.len(), 3);

        agg.ingest(Event::success("B", t(4)));
        assert_eq!(agg.get("B").unwrap().status, TaskStatus::Success);
    }

    #[test]
    fn child_success_leaves_parent_unterminated() {
        let mut agg = agg();
        agg.ingest(Event::start("A", "a", t(0)));
        agg.ingest(Event::spot("B", "b", t(1)).with_parent("A"));
        assert_eq!(agg.get("A").unwrap().status, TaskStatus::Unterminated);
    }

    #[test]
    fn failed_orphan_propagates_after_adoption() {
        let mut agg = agg();
        agg.ingest(Event::start("C", "c", t(1)).with_parent("P"));
        agg.ingest(Event::error("C", t(2)));
        agg.ingest(Event::start("P", "p", t(0)));
        assert_eq!(agg.get("P").unwrap().status, TaskStatus::PartialError);
    }

    #[test]
    fn unattachable_info_is_corrupted_with_trace() {
        let mut agg = agg();
        let task = agg.ingest(Event::info("x", t(0)).with_text("payload", "kept"));
        assert_eq!(task.status, TaskStatus::Corrupted);
        assert_eq!(task.name.as_deref(), Some(LOG_WITHOUT_CONTEXT));
        assert!(!task.texts[STACK_TRACE_FIELD].is_empty());
        assert_eq!(task.texts["payload"], "kept");
        assert!(task.date_to_delete.is_some());
    }

    #[test]
    fn empty_payload_info_is_corrupted() {
        let mut agg = agg();
        let task = agg.ingest(Event::info("x", t(0)));
        assert_eq!(task.status, TaskStatus::Corrupted);
        assert!(task.texts.contains_key(STACK_TRACE_FIELD));
    }

    #[test]
    fn empty_task_id_gets_generated_id() {
        let mut agg = agg();
        let task = agg.ingest(Event::start("", "job", t(0)));
        assert_eq!(task.status, TaskStatus::Corrupted);
        assert!(Uuid::parse_str(&task.id).is_ok());
    }

    #[test]
    fn info_with_name_is_partial_info_only() {
        let mut agg = agg();
        let task = agg.ingest(Event::info("x", t(0)).with_name("side"));
        assert_eq!(task.status, TaskStatus::PartialInfoOnly);
        let task = agg.ingest(Event::start("x", "side", t(1)));
        assert_eq!(task.status, TaskStatus::Unterminated);
    }

    #[test]
    fn primary_id_never_recomputed() {
        let mut agg = agg();
        agg.ingest(Event::start("root", "root", t(0)));
        agg.ingest(
            Event::start("c", "c", t(1))
                .with_parent("root")
                .with_primary("explicit"),
        );
        assert_eq!(agg.get("c").unwrap().primary_id.as_deref(), Some("explicit"));
        agg.ingest(Event::success("c", t(2)).with_primary("other"));
        assert_eq!(agg.get("c").unwrap().primary_id.as_deref(), Some("explicit"));
    }

    #[test]
    fn seeded_parent_resolves_child_without_dirtying_itself() {
        let mut agg = agg();
        let child = Event::start("c", "c", t(1)).with_parent("old");
        assert_eq!(
            agg.unresolved_ids(std::slice::from_ref(&child)),
            vec!["c", "old"]
        );

        let mut parent = Task::new("old", TaskStatus::Unterminated);
        parent.name = Some("old-job".into());
        parent.primary_id = Some("old".into());
        agg.seed_indexed(parent);
        let child = agg.ingest(child);
        assert!(!child.orphan);
        assert_eq!(child.parents_path, Some(vec!["old-job".to_string()]));
        let dirty = agg.drain_dirty();
        assert!(!dirty.contains_key("old"));
    }

    #[test]
    fn unresolved_ids_skip_resident_and_empty_ids() {
        let mut agg = agg();
        agg.ingest(Event::start("p", "p", t(0)));
        let events = vec![
            Event::start("c", "c", t(1)).with_parent("p"),
            Event::info("late", t(1)),
            Event::start("d", "d", t(1)).with_parent("q"),
            Event::start("", "blank", t(1)),
        ];
        assert_eq!(agg.unresolved_ids(&events), vec!["c", "d", "late", "q"]);
    }

    #[test]
    fn late_info_on_seeded_task_keeps_its_status() {
        let mut agg = agg();
        let mut done = Task::new("a", TaskStatus::Success);
        done.name = Some("job".into());
        done.end_time = Some(t(1));
        agg.seed_indexed(done);

        let task = agg.ingest(Event::info("a", t(9)).with_string("late", "x"));
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.name.as_deref(), Some("job"));
        assert_eq!(task.strings["late"], "x");
    }

    #[test]
    fn seeded_orphan_chain_is_adopted_when_root_arrives() {
        let mut agg = agg();
        let mut c = Task::new("C", TaskStatus::Unterminated);
        c.name = Some("c".into());
        c.parent_id = Some("P".into());
        c.orphan = true;
        agg.seed_indexed(c);
        assert_eq!(agg.stats().awaited_parents, 1);

        agg.ingest(Event::start("G", "g", t(2)).with_parent("C"));
        assert!(agg.get("G").unwrap().orphan);

        agg.ingest(Event::start("P", "p", t(0)));
        let c = agg.get("C").unwrap();
        let g = agg.get("G").unwrap();
        assert!(!c.orphan);
        assert!(!g.orphan);
        assert_eq!(c.parents_path, Some(vec!["p".to_string()]));
        assert_eq!(g.parents_path, Some(vec!["p".to_string(), "c".to_string()]));
        assert_eq!(agg.stats().awaited_parents, 0);
        assert!(agg.drain_dirty().contains_key("C"));
    }

    #[test]
    fn seeded_orphan_under_resident_parent_is_adopted_at_once() {
        let mut agg = agg();
        agg.ingest(Event::start("P", "p", t(0)));
        agg.drain_dirty();

        let mut c = Task::new("C", TaskStatus::Error);
        c.parent_id = Some("P".into());
        c.orphan = true;
        c.end_time = Some(t(1));
        agg.seed_indexed(c);

        assert!(!agg.get("C").unwrap().orphan);
        assert_eq!(agg.get("P").unwrap().status, TaskStatus::PartialError);
        assert_eq!(agg.stats().awaited_parents, 0);
        let dirty = agg.drain_dirty();
        assert!(dirty.contains_key("C"));
        assert!(dirty.contains_key("P"));
    }

    #[test]
    fn eviction_keeps_young_orphans_awaited_and_dirty() {
        let mut agg = agg();
        agg.ingest(Event::spot("done", "done", t(0)));
        agg.ingest(Event::spot("orphan", "o", t(0)).with_parent("ghost"));
        agg.ingest(Event::start("open", "open", t(0)));
        assert_eq!(agg.evict_completed(), 0);

        agg.drain_dirty();
        assert_eq!(agg.evict_completed(), 1);
        assert!(!agg.contains("done"));
        assert!(agg.contains("orphan"));
        assert!(agg.contains("open"));
    }

    #[test]
    fn stale_orphans_are_evicted_once_flushed() {
        let mut agg = TaskAggregator::new(MergeSettings {
            orphan_max_age_secs: 0,
            ..MergeSettings::default()
        });
        for i in 0..1000 {
            agg.ingest(Event::spot(format!("s{i}"), "spot", t(0)).with_parent(format!("missing{i}")));
        }
        assert_eq!(agg.evict_completed(), 0);

        agg.drain_dirty();
        assert_eq!(agg.evict_completed(), 1000);
        let stats = agg.stats();
        assert_eq!(stats.resident_tasks, 0);
        assert_eq!(stats.awaited_parents, 0);
    }

    #[test]
    fn orphan_chains_unwind_and_anchored_parents_hold_children() {
        let mut agg = TaskAggregator::new(MergeSettings {
            orphan_max_age_secs: 0,
            ..MergeSettings::default()
        });
        agg.ingest(Event::start("C", "c", t(1)).with_parent("P"));
        agg.ingest(Event::start("G", "g", t(2)).with_parent("C"));
        agg.ingest(Event::start("root", "root", t(0)));
        agg.ingest(Event::start("kid", "kid", t(1)).with_parent("root"));
        agg.drain_dirty();

        assert_eq!(agg.evict_completed(), 2);
        assert!(!agg.contains("C"));
        assert!(!agg.contains("G"));
        assert!(agg.contains("root"));
        assert!(agg.contains("kid"));
        assert_eq!(agg.stats().awaited_parents, 0);
    }

    #[test]
    fn default_env_is_stamped() {
        let mut agg = agg().with_default_env("prod");
        let task = agg.ingest(Event::start("a", "a", t(0)));
        assert_eq!(task.env.as_deref(), Some("prod"));
        let task = agg.ingest(Event::start("b", "b", t(0)).with_env("dev"));
        assert_eq!(task.env.as_deref(), Some("dev"));
    }
}
