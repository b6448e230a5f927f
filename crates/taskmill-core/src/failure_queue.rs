//! Durable failure queue.
//!
//! Batches that exhausted in-memory retries are written to a single SQLite
//! table and pulled back by the disk retry sweep. All access goes through one
//! mutex-guarded connection, and fetches run in an immediate transaction, so
//! a stored batch is handed to at most one fetcher.
//!
//! Calls block; async callers should use `spawn_blocking`.
//!
//! # Stored format
//!
//! The `request` column holds a JSON envelope. Every envelope version ever
//! written stays readable:
//!
//! - v1: a bare array of operations
//! - v2: `{"version": 2, "operations": [...]}`

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bulk::{BulkBatch, UpsertOperation};
use crate::config::Config;
use crate::retry::RetryPolicy;

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Envelope version written by [`encode_operations`].
pub const ENVELOPE_VERSION: u32 = 2;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS failed_bulks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request BLOB NOT NULL,
    insert_time TEXT NOT NULL,
    times_fetched INTEGER NOT NULL DEFAULT 0
);
";

#[derive(Debug, thiserror::Error)]
pub enum FailureQueueError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to decode stored batch {id}: {reason}")]
    Decode { id: i64, reason: String },
    #[error("giving up on batch after {attempts} insert attempts")]
    MaxInsertTries { attempts: u32 },
    #[error("failure queue is unhealthy: {0}")]
    Unhealthy(String),
    #[error("queue schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },
    #[error("failure queue is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, FailureQueueError>;

/// Failure queue settings.
#[derive(Debug, Clone)]
pub struct FailureQueueConfig {
    pub path: PathBuf,
    pub max_insert_tries: u32,
    pub max_fetched_bulks_in_one_time: usize,
    pub insert_retry_delay: Duration,
}

impl FailureQueueConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_insert_tries: 10,
            max_fetched_bulks_in_one_time: 100,
            insert_retry_delay: Duration::from_millis(50),
        }
    }
}

impl From<&Config> for FailureQueueConfig {
    fn from(config: &Config) -> Self {
        Self {
            path: config.failure_queue_path(),
            max_insert_tries: config.persistence.max_insert_tries,
            max_fetched_bulks_in_one_time: config.persistence.max_fetched_bulks_in_one_time,
            insert_retry_delay: Duration::from_millis(config.persistence.insert_retry_delay_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    operations: Vec<UpsertOperation>,
}

/// Serialize operations into the current envelope.
pub fn encode_operations(operations: &[UpsertOperation]) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct EnvelopeRef<'a> {
        version: u32,
        operations: &'a [UpsertOperation],
    }
    Ok(serde_json::to_vec(&EnvelopeRef {
        version: ENVELOPE_VERSION,
        operations,
    })?)
}

/// Read operations from any envelope version.
pub fn decode_operations(bytes: &[u8]) -> std::result::Result<Vec<UpsertOperation>, String> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    match value {
        Value::Array(_) => serde_json::from_value(value).map_err(|e| e.to_string()),
        Value::Object(_) => {
            let envelope: Envelope = serde_json::from_value(value).map_err(|e| e.to_string())?;
            if envelope.version > ENVELOPE_VERSION {
                return Err(format!(
                    "envelope version {} is newer than supported {ENVELOPE_VERSION}",
                    envelope.version
                ));
            }
            Ok(envelope.operations)
        }
        other => Err(format!("unexpected stored batch shape: {other}")),
    }
}

/// SQLite-backed queue of undeliverable batches.
pub struct FailureQueue {
    conn: Mutex<Option<Connection>>,
    config: FailureQueueConfig,
}

impl std::fmt::Debug for FailureQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureQueue")
            .field("path", &self.config.path)
            .finish()
    }
}

impl FailureQueue {
    /// Open or create the queue file.
    pub fn open(config: FailureQueueConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

        let current: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if current > SCHEMA_VERSION {
            return Err(FailureQueueError::SchemaTooNew {
                current,
                supported: SCHEMA_VERSION,
            });
        }
        conn.execute_batch(SCHEMA_SQL)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        info!(path = %config.path.display(), "Failure queue opened");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            config,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    #[must_use]
    pub fn config(&self) -> &FailureQueueConfig {
        &self.config
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(FailureQueueError::Closed)?;
        f(conn)
    }

    /// Store a batch, retrying the insert up to `max_insert_tries` times.
    pub fn persist(&self, batch: &BulkBatch) -> Result<()> {
        let request = encode_operations(&batch.operations)?;
        let insert_time = batch.insert_time.unwrap_or_else(Utc::now).to_rfc3339();
        let times_fetched = i64::from(batch.times_fetched);
        let policy = RetryPolicy::queue_insert(
            self.config.insert_retry_delay,
            self.config.max_insert_tries,
        );

        for attempt in 1..=policy.max_attempts {
            let result = self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO failed_bulks (request, insert_time, times_fetched) VALUES (?1, ?2, ?3)",
                    params![request, insert_time, times_fetched],
                )?;
                Ok(())
            });
            match result {
                Ok(()) => {
                    debug!(
                        batch_ops = batch.len(),
                        times_fetched = batch.times_fetched,
                        "Batch persisted to failure queue"
                    );
                    return Ok(());
                }
                Err(FailureQueueError::Closed) => return Err(FailureQueueError::Closed),
                Err(e) => {
                    warn!(attempt, error = %e, "Failure queue insert failed");
                    if attempt < policy.max_attempts {
                        std::thread::sleep(policy.delay_for_attempt(attempt - 1));
                    }
                }
            }
        }
        Err(FailureQueueError::MaxInsertTries {
            attempts: policy.max_attempts,
        })
    }

    fn select_oldest(
        conn: &Connection,
        limit: usize,
    ) -> Result<Vec<(i64, Vec<u8>, String, i64)>> {
        let mut stmt = conn.prepare(
            "SELECT id, request, insert_time, times_fetched FROM failed_bulks ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn decode_rows(rows: Vec<(i64, Vec<u8>, String, i64)>, fetched: bool) -> Vec<BulkBatch> {
        rows.into_iter()
            .filter_map(|(id, request, insert_time, times_fetched)| {
                match decode_operations(&request) {
                    Ok(operations) => Some(BulkBatch {
                        operations,
                        times_fetched: u32::try_from(times_fetched)
                            .unwrap_or(u32::MAX)
                            .saturating_add(u32::from(fetched)),
                        insert_time: DateTime::parse_from_rfc3339(&insert_time)
                            .ok()
                            .map(|t| t.with_timezone(&Utc)),
                        queue_id: Some(id),
                    }),
                    Err(reason) => {
                        warn!(id, %reason, "Dropping undecodable batch from failure queue");
                        None
                    }
                }
            })
            .collect()
    }

    /// Remove and return up to `max_fetched_bulks_in_one_time` oldest batches.
    ///
    /// Each returned batch has `times_fetched` incremented.
    pub fn fetch_and_delete_failed_bulks(&self) -> Result<Vec<BulkBatch>> {
        let limit = self.config.max_fetched_bulks_in_one_time;
        let rows = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let rows = Self::select_oldest(&tx, limit)?;
            {
                let mut delete = tx.prepare("DELETE FROM failed_bulks WHERE id = ?1")?;
                for (id, ..) in &rows {
                    delete.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(rows)
        })?;
        let batches = Self::decode_rows(rows, true);
        if !batches.is_empty() {
            debug!(count = batches.len(), "Fetched batches from failure queue");
        }
        Ok(batches)
    }

    /// Same selection as a fetch, without removing or counting.
    pub fn peek_failed_bulks(&self) -> Result<Vec<BulkBatch>> {
        let limit = self.config.max_fetched_bulks_in_one_time;
        let rows = self.with_conn(|conn| Self::select_oldest(conn, limit))?;
        Ok(Self::decode_rows(rows, false))
    }

    pub fn has_failed_bulks(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM failed_bulks)",
                [],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    pub fn failed_bulks_amount(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM failed_bulks", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Verify the file is readable and the table exists.
    pub fn health_check(&self) -> Result<()> {
        self.with_conn(|conn| {
            let verdict: String = conn
                .query_row("PRAGMA quick_check", [], |row| row.get(0))
                .map_err(|e| FailureQueueError::Unhealthy(e.to_string()))?;
            if verdict != "ok" {
                return Err(FailureQueueError::Unhealthy(verdict));
            }
            let table: Option<String> = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'failed_bulks'",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| FailureQueueError::Unhealthy(e.to_string()))?;
            if table.is_none() {
                return Err(FailureQueueError::Unhealthy(
                    "failed_bulks table is missing".to_string(),
                ));
            }
            Ok(())
        })
    }

    /// Drop and recreate the table, discarding every stored batch.
    pub fn reset(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("DROP TABLE IF EXISTS failed_bulks;")?;
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })?;
        warn!(path = %self.config.path.display(), "Failure queue reset");
        Ok(())
    }

    /// Release the connection. Later calls return [`FailureQueueError::Closed`].
    pub fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| FailureQueueError::Sqlite(e))?;
            info!(path = %self.config.path.display(), "Failure queue closed");
        }
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }
}
