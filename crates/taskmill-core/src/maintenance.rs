//! Periodic maintenance loops.
//!
//! Four loops share one shutdown signal:
//!
//! - memory retry sweep
//! - disk retry sweep (after a failure queue health check)
//! - rollover check for every known alias
//! - TTL expiry

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backend::SearchBackend;
use crate::config::ScheduleConfig;
use crate::error::{Error, Result};
use crate::indexer::BulkIndexer;
use crate::lifecycle::IndexLifecycle;

/// How often each loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceIntervals {
    pub memory_retry: Duration,
    pub disk_retry: Duration,
    pub rollover: Duration,
    pub expiry: Duration,
}

impl From<&ScheduleConfig> for MaintenanceIntervals {
    fn from(schedule: &ScheduleConfig) -> Self {
        Self {
            memory_retry: Duration::from_secs(schedule.memory_retry_interval_secs),
            disk_retry: Duration::from_secs(schedule.disk_retry_interval_secs),
            rollover: Duration::from_secs(schedule.rollover_interval_secs),
            expiry: Duration::from_secs(schedule.expiry_interval_secs),
        }
    }
}

/// Running loops plus what they need to shut down cleanly.
pub struct MaintenanceHandle<B> {
    shutdown: watch::Sender<bool>,
    loops: Vec<(&'static str, JoinHandle<()>)>,
    indexer: BulkIndexer<B>,
}

impl<B: SearchBackend> MaintenanceHandle<B> {
    /// Stop every loop, wait for them, close the pipeline and the failure
    /// queue.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.loops {
            if let Err(e) = handle.await {
                warn!(loop_name = name, error = %e, "Maintenance loop ended abnormally");
            }
        }
        self.indexer.close().await;

        if let Some(queue) = self.indexer.failure_queue().cloned() {
            tokio::task::spawn_blocking(move || queue.close())
                .await
                .map_err(|e| Error::Runtime(format!("failure queue close task failed: {e}")))??;
        }
        info!("Maintenance stopped");
        Ok(())
    }

    #[must_use]
    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }
}

async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; loops start one period in.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            _ = shutdown.changed() => {
                debug!(loop_name = name, "Maintenance loop stopping");
                break;
            }
        }
    }
}

async fn disk_sweep<B: SearchBackend>(indexer: &BulkIndexer<B>, shutdown: &watch::Receiver<bool>) {
    let Some(queue) = indexer.failure_queue().cloned() else {
        return;
    };
    let health = tokio::task::spawn_blocking(move || queue.health_check()).await;
    match health {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "Failure queue unhealthy, skipping disk retry");
            return;
        }
        Err(e) => {
            error!(error = %e, "Failure queue health check task failed");
            return;
        }
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        match indexer.retry_failed_from_disk().await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!(error = %e, "Disk retry sweep failed");
                break;
            }
        }
    }
}

/// Spawn the maintenance loops on the current runtime.
pub fn spawn_maintenance<B: SearchBackend>(
    indexer: BulkIndexer<B>,
    lifecycle: Arc<IndexLifecycle<B>>,
    intervals: MaintenanceIntervals,
) -> MaintenanceHandle<B> {
    let (shutdown, rx) = watch::channel(false);
    let mut loops = Vec::with_capacity(4);

    let memory_indexer = indexer.clone();
    loops.push((
        "memory_retry",
        tokio::spawn(run_periodic("memory_retry", intervals.memory_retry, rx.clone(), move || {
            let indexer = memory_indexer.clone();
            async move {
                if let Err(e) = indexer.retry_failed_from_memory().await {
                    warn!(error = %e, "Memory retry sweep failed");
                }
            }
        })),
    ));

    let disk_indexer = indexer.clone();
    let disk_rx = rx.clone();
    loops.push((
        "disk_retry",
        tokio::spawn(run_periodic("disk_retry", intervals.disk_retry, rx.clone(), move || {
            let indexer = disk_indexer.clone();
            let shutdown = disk_rx.clone();
            async move { disk_sweep(&indexer, &shutdown).await }
        })),
    ));

    let rollover_lifecycle = Arc::clone(&lifecycle);
    loops.push((
        "rollover",
        tokio::spawn(run_periodic("rollover", intervals.rollover, rx.clone(), move || {
            let lifecycle = Arc::clone(&rollover_lifecycle);
            async move {
                for alias in lifecycle.known_aliases() {
                    match lifecycle.maybe_rollover(&alias).await {
                        Ok(Some(report)) => info!(
                            alias = %alias,
                            new_index = %report.new_index,
                            migrated = report.migration.found,
                            "Rollover complete"
                        ),
                        Ok(None) => {}
                        Err(e) => warn!(alias = %alias, error = %e, "Rollover check failed"),
                    }
                }
            }
        })),
    ));

    let expiry_lifecycle = lifecycle;
    loops.push((
        "expiry",
        tokio::spawn(run_periodic("expiry", intervals.expiry, rx, move || {
            let lifecycle = Arc::clone(&expiry_lifecycle);
            async move {
                if let Err(e) = lifecycle.delete_expired_tasks().await {
                    warn!(error = %e, "Expired task deletion failed");
                }
            }
        })),
    ));

    info!(?intervals, "Maintenance started");
    MaintenanceHandle {
        shutdown,
        loops,
        indexer,
    }
}
