//! Shared fixtures for taskmill-core integration tests.

#![allow(dead_code)]

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use taskmill_core::config::{BackendKind, Config};
use taskmill_core::{MemoryBackend, Taskmill};

/// Fixed instant plus `secs` seconds.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Config tuned for fast tests: in-memory backend, millisecond backoff,
/// failure queue inside `data_dir`.
pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.general.env = "it".to_string();
    config.general.data_dir = data_dir.to_path_buf();
    config.backend.kind = BackendKind::Memory;
    config.backend.backoff_unit_ms = 1;
    config.backend.max_retries = 1;
    config.persistence.insert_retry_delay_ms = 1;
    config
}

/// Runtime over a backend the test keeps a handle to.
pub fn memory_runtime(config: Config) -> (Taskmill<MemoryBackend>, MemoryBackend) {
    let backend = MemoryBackend::new();
    let runtime = Taskmill::with_backend(config, backend.clone()).unwrap();
    (runtime, backend)
}
