//! taskmill-core: task lifecycle aggregation and resilient indexing
//!
//! Instrumented applications emit small lifecycle events (start, success,
//! error, info, spot). This crate folds them into one document per task and
//! keeps those documents flowing into an Elasticsearch-style backend through
//! outages.
//!
//! # Architecture
//!
//! ```text
//! events → IngestService → TaskAggregator → dirty snapshots
//!                                               ↓
//!                        BulkIndexer → backend (bulk upsert + merge script)
//!                           ↓ failed
//!                    retry queue → FailureQueue (SQLite) → disk sweep
//!
//! IndexLifecycle: alias, rollover + partial task migration, TTL expiry
//! ```
//!
//! # Modules
//!
//! - `task`: events, statuses and the task document
//! - `aggregator`: per-task state machine with orphan adoption
//! - `bulk`: upsert operations and size-bounded batches
//! - `backend`: search backend trait, in-memory and HTTP implementations
//! - `indexer`: concurrent bulk pipeline with tiered retry
//! - `failure_queue`: durable SQLite queue of undeliverable batches
//! - `query`: scroll-based task lookups
//! - `lifecycle`: alias, rollover, migration and expiry
//! - `ingest`: async façade over the aggregator
//! - `maintenance`: periodic retry, rollover and expiry loops
//! - `runtime`: wiring from [`config::Config`]
//! - `config`, `logging`, `error`, `retry`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod backend;
pub mod bulk;
pub mod config;
pub mod error;
pub mod failure_queue;
pub mod indexer;
pub mod ingest;
pub mod lifecycle;
pub mod logging;
pub mod maintenance;
pub mod query;
pub mod retry;
pub mod runtime;
pub mod task;

pub use aggregator::TaskAggregator;
pub use backend::{AnyBackend, HttpBackend, MemoryBackend, SearchBackend};
pub use config::Config;
pub use error::{Error, Result};
pub use failure_queue::FailureQueue;
pub use indexer::BulkIndexer;
pub use runtime::Taskmill;
pub use task::{Event, EventKind, Task, TaskStatus};
