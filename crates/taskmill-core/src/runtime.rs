//! Process-level wiring: one backend, one pipeline, one failure queue.

use std::sync::Arc;

use tracing::info;

use crate::backend::{AnyBackend, HttpBackend, MemoryBackend, SearchBackend};
use crate::config::{BackendKind, Config};
use crate::error::{Error, Result};
use crate::failure_queue::{FailureQueue, FailureQueueConfig};
use crate::indexer::{BulkIndexer, IndexerSettings};
use crate::ingest::IngestService;
use crate::lifecycle::{IndexLifecycle, LifecycleSettings};
use crate::maintenance::{MaintenanceHandle, MaintenanceIntervals, spawn_maintenance};
use crate::query::TaskQueries;
use crate::task::MergeSettings;

/// Every long-lived component, built from one [`Config`].
pub struct Taskmill<B = AnyBackend> {
    config: Config,
    indexer: BulkIndexer<B>,
    queries: TaskQueries<B>,
    lifecycle: Arc<IndexLifecycle<B>>,
    ingest: IngestService<B>,
}

/// Backend selected by `backend.kind`.
pub fn backend_from_config(config: &Config) -> Result<AnyBackend> {
    Ok(match config.backend.kind {
        BackendKind::Memory => AnyBackend::Memory(MemoryBackend::new()),
        BackendKind::Http => AnyBackend::Http(HttpBackend::new(&config.backend)?),
    })
}

/// Open the failure queue when persistence is enabled.
pub fn open_failure_queue(config: &Config) -> Result<Option<Arc<FailureQueue>>> {
    if !config.persistence.enabled {
        return Ok(None);
    }
    let queue = FailureQueue::open(FailureQueueConfig::from(config))?;
    Ok(Some(Arc::new(queue)))
}

impl Taskmill<AnyBackend> {
    /// Validate `config` and build everything it describes.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = backend_from_config(&config)?;
        Self::with_backend(config, backend)
    }
}

impl<B: SearchBackend + Clone> Taskmill<B> {
    pub fn with_backend(config: Config, backend: B) -> Result<Self> {
        let failure_queue = open_failure_queue(&config)?;
        let indexer = BulkIndexer::new(
            backend.clone(),
            IndexerSettings::from(&config),
            failure_queue,
        );
        let queries = TaskQueries::from_config(backend, &config);
        let lifecycle = Arc::new(IndexLifecycle::new(
            indexer.clone(),
            queries.clone(),
            LifecycleSettings::from(&config),
        ));
        let ingest = IngestService::new(
            MergeSettings::from(&config.indexing),
            config.general.env.clone(),
            indexer.clone(),
            queries.clone(),
            Arc::clone(&lifecycle),
        );
        Ok(Self {
            config,
            indexer,
            queries,
            lifecycle,
            ingest,
        })
    }

    /// Install template and script, then make sure the default alias exists.
    pub async fn start(&self) -> Result<String> {
        self.lifecycle.bootstrap().await?;
        let alias = self.lifecycle.ensure_alias(&self.config.general.env).await;
        info!(alias = %alias, "taskmill started");
        Ok(alias)
    }

    #[must_use]
    pub fn spawn_maintenance(&self) -> MaintenanceHandle<B> {
        spawn_maintenance(
            self.indexer.clone(),
            Arc::clone(&self.lifecycle),
            MaintenanceIntervals::from(&self.config.schedule),
        )
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn ingest(&self) -> &IngestService<B> {
        &self.ingest
    }

    #[must_use]
    pub fn indexer(&self) -> &BulkIndexer<B> {
        &self.indexer
    }

    #[must_use]
    pub fn queries(&self) -> &TaskQueries<B> {
        &self.queries
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<IndexLifecycle<B>> {
        &self.lifecycle
    }

    /// Close the pipeline and the failure queue without maintenance loops.
    pub async fn close(&self) -> Result<()> {
        self.indexer.close().await;
        if let Some(queue) = self.indexer.failure_queue().cloned() {
            tokio::task::spawn_blocking(move || queue.close())
                .await
                .map_err(|e| Error::Runtime(format!("failure queue close task failed: {e}")))??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Event;
    use chrono::Utc;

    fn memory_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.backend.kind = BackendKind::Memory;
        config.general.data_dir = dir.path().to_path_buf();
        config.general.env = "unit".into();
        config
    }

    #[tokio::test]
    async fn memory_runtime_starts_and_ingests() {
        let dir = tempfile::tempdir().unwrap();
        let tm = Taskmill::from_config(memory_config(&dir)).unwrap();
        assert_eq!(tm.start().await.unwrap(), "taskmill-unit");
        assert!(tm.indexer().failure_queue().is_some());
        assert!(dir.path().join("failed_bulks.db").exists());

        tm.ingest().ingest(Event::start("a", "job", Utc::now())).await;
        let report = tm.ingest().flush().await.unwrap();
        assert_eq!(report.operations, 1);
        let stored = tm.queries().task_by_id("a").await.unwrap();
        assert!(stored.is_some());
        tm.close().await.unwrap();
    }

    #[test]
    fn disabled_persistence_has_no_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config(&dir);
        config.persistence.enabled = false;
        assert!(open_failure_queue(&config).unwrap().is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config(&dir);
        config.indexing.indexing_threads = 0;
        assert!(Taskmill::from_config(config).is_err());
    }
}
