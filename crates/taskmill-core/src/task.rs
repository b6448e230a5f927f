//! Task and event data model.
//!
//! An [`Event`] is one observed occurrence for a task id. A [`Task`] is the
//! aggregate built from every event seen for that id. Merging is idempotent:
//! applying the same event twice leaves the task unchanged after the first
//! application, so at-least-once delivery upstream is safe.
//!
//! # Status transitions
//!
//! | current \ event        | START        | SUCCESS         | ERROR         | INFO              | SPOT      |
//! |------------------------|--------------|-----------------|---------------|-------------------|-----------|
//! | (new)                  | UNTERMINATED | PARTIAL_SUCCESS | PARTIAL_ERROR | PARTIAL_INFO_ONLY | SUCCESS   |
//! | PARTIAL_INFO_ONLY      | UNTERMINATED | PARTIAL_SUCCESS | PARTIAL_ERROR | =                 | SUCCESS   |
//! | UNTERMINATED           | =            | SUCCESS         | ERROR         | =                 | SUCCESS   |
//! | PARTIAL_SUCCESS        | SUCCESS      | =               | CORRUPTED     | =                 | SUCCESS   |
//! | PARTIAL_ERROR (own)    | ERROR        | CORRUPTED       | =             | =                 | CORRUPTED |
//! | PARTIAL_ERROR (child)  | =            | SUCCESS         | ERROR         | =                 | SUCCESS   |
//! | SUCCESS                | =            | =               | CORRUPTED     | =                 | =         |
//! | ERROR                  | =            | CORRUPTED       | =             | =                 | CORRUPTED |
//! | CORRUPTED              | =            | =               | =             | =                 | =         |
//!
//! "own" PARTIAL_ERROR means the task received its own ERROR before its
//! START; "child" means an UNTERMINATED task was marked because a descendant
//! failed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::IndexingConfig;

/// Name given to tasks that could not be attached to anything.
pub const LOG_WITHOUT_CONTEXT: &str = "LogWithoutContext";

/// Text field carrying the capture point of a corrupted task.
pub const STACK_TRACE_FIELD: &str = "stackTrace";

/// Kind of lifecycle occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Success,
    Error,
    /// Side-channel payload for an id; also used for context-only updates
    Info,
    /// A task that started and succeeded in one shot
    Spot,
}

/// Aggregate status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Unterminated,
    Success,
    Error,
    PartialSuccess,
    PartialError,
    PartialInfoOnly,
    Corrupted,
}

impl TaskStatus {
    /// Statuses carried over to a new index on rollover.
    pub const PARTIAL: [Self; 4] = [
        Self::Unterminated,
        Self::PartialError,
        Self::PartialInfoOnly,
        Self::PartialSuccess,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unterminated => "UNTERMINATED",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::PartialSuccess => "PARTIAL_SUCCESS",
            Self::PartialError => "PARTIAL_ERROR",
            Self::PartialInfoOnly => "PARTIAL_INFO_ONLY",
            Self::Corrupted => "CORRUPTED",
        }
    }

    /// No further event can move the task out of this status normally.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Corrupted)
    }

    #[must_use]
    pub fn is_partial(self) -> bool {
        Self::PARTIAL.contains(&self)
    }

    /// Derive the next status.
    ///
    /// `own_terminal` is true once the task has received its own SUCCESS,
    /// ERROR or SPOT (i.e. it has an end time).
    #[must_use]
    pub fn next(current: Option<Self>, own_terminal: bool, kind: EventKind) -> Self {
        use EventKind as K;
        use TaskStatus as S;

        match (current, kind) {
            (None | Some(S::PartialInfoOnly), K::Start) => S::Unterminated,
            (None | Some(S::PartialInfoOnly), K::Success) => S::PartialSuccess,
            (None | Some(S::PartialInfoOnly), K::Error) => S::PartialError,
            (None | Some(S::PartialInfoOnly), K::Info) => S::PartialInfoOnly,
            (None | Some(S::PartialInfoOnly), K::Spot) => S::Success,

            (Some(S::Unterminated), K::Success | K::Spot) => S::Success,
            (Some(S::Unterminated), K::Error) => S::Error,
            (Some(S::Unterminated), K::Start | K::Info) => S::Unterminated,

            (Some(S::PartialSuccess), K::Start | K::Spot) => S::Success,
            (Some(S::PartialSuccess), K::Error) => S::Corrupted,
            (Some(S::PartialSuccess), K::Success | K::Info) => S::PartialSuccess,

            (Some(S::PartialError), K::Start) if own_terminal => S::Error,
            (Some(S::PartialError), K::Success | K::Spot) if own_terminal => S::Corrupted,
            (Some(S::PartialError), K::Success | K::Spot) => S::Success,
            (Some(S::PartialError), K::Error) if !own_terminal => S::Error,
            (Some(S::PartialError), _) => S::PartialError,

            (Some(S::Success), K::Error) => S::Corrupted,
            (Some(S::Success), _) => S::Success,

            (Some(S::Error), K::Success | K::Spot) => S::Corrupted,
            (Some(S::Error), _) => S::Error,

            (Some(S::Corrupted), _) => S::Corrupted,
        }
    }

    /// Status of a stored task once an update computed elsewhere lands on it.
    ///
    /// The update may come from an aggregator that never saw the stored copy,
    /// so a non-terminal update is replayed as the event that produced it. An
    /// INFO-only update never changes the stored status, and two different
    /// terminal statuses conflict into CORRUPTED.
    #[must_use]
    pub fn merge_stored(stored: Self, stored_ended: bool, update: Self, update_ended: bool) -> Self {
        use EventKind as K;
        use TaskStatus as S;

        match update {
            S::Success | S::Error | S::Corrupted if stored.is_terminal() && stored != update => {
                S::Corrupted
            }
            S::Success | S::Error | S::Corrupted => update,
            S::Unterminated => Self::next(Some(stored), stored_ended, K::Start),
            S::PartialSuccess => Self::next(Some(stored), stored_ended, K::Success),
            S::PartialError if update_ended => Self::next(Some(stored), stored_ended, K::Error),
            S::PartialError if stored.is_terminal() => stored,
            S::PartialError => S::PartialError,
            S::PartialInfoOnly => stored,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed occurrence for a task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub task_id: String,
    pub kind: EventKind,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub strings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub texts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl Event {
    #[must_use]
    pub fn new(task_id: impl Into<String>, kind: EventKind, time: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            time,
            name: None,
            parent_id: None,
            primary_id: None,
            env: None,
            strings: BTreeMap::new(),
            metrics: BTreeMap::new(),
            texts: BTreeMap::new(),
            logs: Vec::new(),
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn start(task_id: impl Into<String>, name: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::new(task_id, EventKind::Start, time).with_name(name)
    }

    #[must_use]
    pub fn success(task_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::new(task_id, EventKind::Success, time)
    }

    #[must_use]
    pub fn error(task_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::new(task_id, EventKind::Error, time)
    }

    #[must_use]
    pub fn info(task_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::new(task_id, EventKind::Info, time)
    }

    #[must_use]
    pub fn spot(task_id: impl Into<String>, name: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::new(task_id, EventKind::Spot, time).with_name(name)
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_primary(mut self, primary_id: impl Into<String>) -> Self {
        self.primary_id = Some(primary_id.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }

    #[must_use]
    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_text(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.texts.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Non-empty parent id, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent_id.as_deref().filter(|p| !p.is_empty())
    }

    /// Non-empty name, if any.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }

    /// True when the event carries nothing that could identify or describe a task.
    #[must_use]
    pub fn has_empty_payload(&self) -> bool {
        self.strings.is_empty()
            && self.metrics.is_empty()
            && self.texts.is_empty()
            && self.logs.is_empty()
            && self.context.is_empty()
    }
}

/// Limits and retention applied while aggregating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSettings {
    pub max_string_chars: usize,
    pub max_text_chars: usize,
    pub ttl_days: u32,
    /// Flushed orphans older than this are evicted while their parent is unknown
    pub orphan_max_age_secs: u64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self::from(&IndexingConfig::default())
    }
}

impl From<&IndexingConfig> for MergeSettings {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            max_string_chars: config.max_string_chars,
            max_text_chars: config.max_text_chars,
            ttl_days: config.ttl_days,
            orphan_max_age_secs: config.orphan_max_age_secs,
        }
    }
}

/// Aggregate record for one task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub primary_id: Option<String>,
    #[serde(default)]
    pub parents_path: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub orphan: bool,
    #[serde(default)]
    pub date_to_delete: Option<DateTime<Utc>>,
    #[serde(default)]
    pub strings: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub texts: BTreeMap<String, String>,
    #[serde(default)]
    pub ctx: BTreeMap<String, String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl Task {
    /// Empty task shell; `status` is set by the first applied event.
    #[must_use]
    pub fn new(id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: id.into(),
            name: None,
            status,
            start_time: None,
            end_time: None,
            duration_ms: None,
            parent_id: None,
            primary_id: None,
            parents_path: None,
            env: None,
            orphan: false,
            date_to_delete: None,
            strings: BTreeMap::new(),
            metrics: BTreeMap::new(),
            texts: BTreeMap::new(),
            ctx: BTreeMap::new(),
            logs: Vec::new(),
        }
    }

    /// Path handed to children: own ancestors followed by own name.
    #[must_use]
    pub fn path_for_children(&self) -> Vec<String> {
        let mut path = self.parents_path.clone().unwrap_or_default();
        if let Some(name) = self.name.as_deref() {
            path.push(name.to_string());
        }
        path
    }

    /// Apply an event's lifecycle transition, times and TTL.
    ///
    /// `current` is `None` when the task did not exist before this event.
    pub fn apply_transition(
        &mut self,
        current: Option<TaskStatus>,
        event: &Event,
        settings: &MergeSettings,
    ) {
        let own_terminal = self.end_time.is_some();
        self.status = TaskStatus::next(current, own_terminal, event.kind);

        match event.kind {
            EventKind::Start => self.start_time = earliest(self.start_time, event.time),
            EventKind::Success | EventKind::Error => {
                self.end_time = earliest(self.end_time, event.time);
            }
            EventKind::Spot => {
                self.start_time = earliest(self.start_time, event.time);
                self.end_time = earliest(self.end_time, event.time);
            }
            EventKind::Info => {}
        }

        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            self.duration_ms = Some((end - start).num_milliseconds().max(0));
        }

        if self.status.is_terminal() && self.date_to_delete.is_none() {
            let anchor = self.end_time.unwrap_or(event.time);
            self.date_to_delete = Some(anchor + ChronoDuration::days(i64::from(settings.ttl_days)));
        }
    }

    /// Merge an update produced by an aggregator into this stored copy.
    ///
    /// Mirrors the stored merge script: status follows
    /// [`TaskStatus::merge_stored`], the first name, primary id and deletion
    /// date stick, times keep the earliest value and payload maps are unioned.
    /// A context-less update for a task that already has a name only adds
    /// payload.
    pub fn merge_update(&mut self, update: &Task) {
        let context_less = update.name.as_deref() == Some(LOG_WITHOUT_CONTEXT) && self.name.is_some();
        if !context_less {
            self.status = TaskStatus::merge_stored(
                self.status,
                self.end_time.is_some(),
                update.status,
                update.end_time.is_some(),
            );
        }

        if self.name.is_none() {
            self.name.clone_from(&update.name);
        }
        if self.primary_id.is_none() {
            self.primary_id.clone_from(&update.primary_id);
        }
        if self.date_to_delete.is_none() {
            self.date_to_delete = update.date_to_delete;
        }
        if let Some(start) = update.start_time {
            self.start_time = earliest(self.start_time, start);
        }
        if let Some(end) = update.end_time {
            self.end_time = earliest(self.end_time, end);
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            self.duration_ms = Some((end - start).num_milliseconds().max(0));
        }
        if update.parent_id.is_some() {
            self.parent_id.clone_from(&update.parent_id);
        }
        if update.env.is_some() {
            self.env.clone_from(&update.env);
        }
        if update.parents_path.is_some() {
            self.parents_path.clone_from(&update.parents_path);
        }
        self.orphan = update.orphan && self.parents_path.is_none();

        self.strings.extend(update.strings.clone());
        self.metrics.extend(update.metrics.clone());
        self.texts.extend(update.texts.clone());
        self.ctx.extend(update.ctx.clone());
        for line in &update.logs {
            if !self.logs.contains(line) {
                self.logs.push(line.clone());
            }
        }
    }

    /// Union the event's payload into this task.
    pub fn merge_payload(&mut self, event: &Event, settings: &MergeSettings) {
        if self.name.is_none() {
            if let Some(name) = event.display_name() {
                self.name = Some(name.to_string());
            }
        }
        if let Some(env) = event.env.as_deref().filter(|e| !e.is_empty()) {
            self.env = Some(env.to_string());
        }
        for (key, value) in &event.strings {
            self.strings
                .insert(key.clone(), truncate_chars(value, settings.max_string_chars));
        }
        for (key, value) in &event.metrics {
            self.metrics.insert(key.clone(), normalize_metric(*value));
        }
        for (key, value) in &event.texts {
            self.texts
                .insert(key.clone(), truncate_chars(value, settings.max_text_chars));
        }
        for (key, value) in &event.context {
            self.ctx.insert(key.clone(), value.clone());
        }
        for line in &event.logs {
            let formatted = format_log_line(event.time, line);
            if !self.logs.contains(&formatted) {
                self.logs.push(formatted);
            }
        }
    }
}

fn earliest(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

/// Non-finite metrics are stored as zero.
#[must_use]
pub fn normalize_metric(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// Render a log line the way tasks store it.
#[must_use]
pub fn format_log_line(time: DateTime<Utc>, line: &str) -> String {
    format!(
        "[{}] [INFO] - {line}",
        time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    )
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => value[..cut].to_string(),
        None => value.to_string(),
    }
}
