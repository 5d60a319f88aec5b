//! Background driver that keeps calling the batch generator until each page
//! type is done, then sleeps and starts over so new source items get picked up.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config;
use crate::error::{CacheError, Result};
use crate::generator::BatchGenerator;
use crate::model::{BatchResult, PageType};
use crate::shutdown::{self, Shutdown, ShutdownHandle};

/// Totals over all batches of one drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSummary {
    pub page_type: PageType,
    pub batches: u64,
    pub processed: u64,
    pub generated: u64,
    pub errors: u64,
    pub last: Option<BatchResult>,
}

impl DriveSummary {
    fn new(page_type: PageType) -> Self {
        Self {
            page_type,
            batches: 0,
            processed: 0,
            generated: 0,
            errors: 0,
            last: None,
        }
    }

    fn add(&mut self, batch: BatchResult) {
        self.batches += 1;
        self.processed += batch.processed;
        self.generated += batch.generated;
        self.errors += batch.errors;
        self.last = Some(batch);
    }

    pub fn done(&self) -> bool {
        self.last.as_ref().is_some_and(|b| b.done)
    }
}

/// Call `run_batch` for `page_type` until it reports done. `reset_first`
/// applies to the first call only. Waits `delay` between calls and stops
/// early when `shutdown` fires.
pub async fn drive_to_completion(
    generator: &BatchGenerator,
    page_type: PageType,
    batch_size: u32,
    reset_first: bool,
    delay: Duration,
    shutdown: &Shutdown,
) -> Result<DriveSummary> {
    let mut summary = DriveSummary::new(page_type);
    let mut reset = reset_first;
    let mut shutdown = shutdown.clone();
    loop {
        let batch = generator
            .run_batch(page_type, batch_size, reset, &shutdown)
            .await?;
        reset = false;
        let done = batch.done;
        let stalled = batch.processed == 0;
        debug!(
            page_type = %page_type,
            offset = batch.current_offset,
            total = batch.total_count,
            "batch finished"
        );
        summary.add(batch);
        // An empty slice short of the total means the source shrank under us;
        // the next cycle will pick up the refreshed count.
        if done || stalled {
            return Ok(summary);
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(CacheError::Cancelled { page_type }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Owns the scheduler task and its cancellation signal.
pub struct SchedulerHandle {
    shutdown: Option<ShutdownHandle>,
    worker: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop at the next item boundary and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.trigger();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.await;
        }
    }
}

pub fn spawn(generator: BatchGenerator, cfg: config::Scheduler) -> SchedulerHandle {
    let (handle, shutdown) = shutdown::channel();
    let worker = tokio::spawn(run(generator, cfg, shutdown));
    SchedulerHandle {
        shutdown: Some(handle),
        worker: Some(worker),
    }
}

pub async fn run(generator: BatchGenerator, cfg: config::Scheduler, mut shutdown: Shutdown) {
    info!(page_types = cfg.page_types.len(), "scheduler started");
    let delay = cfg.inter_call_delay();
    loop {
        let drives = cfg.page_types.iter().map(|pt| {
            let generator = &generator;
            let shutdown = &shutdown;
            async move {
                (
                    *pt,
                    drive_to_completion(generator, *pt, cfg.batch_size, false, delay, shutdown).await,
                )
            }
        });
        for (page_type, outcome) in join_all(drives).await {
            match outcome {
                Ok(summary) => info!(
                    page_type = %page_type,
                    batches = summary.batches,
                    processed = summary.processed,
                    errors = summary.errors,
                    "page type drive finished"
                ),
                Err(CacheError::Cancelled { .. }) => {}
                Err(CacheError::ConcurrencyConflict { .. }) => {
                    debug!(page_type = %page_type, "another run holds this page type")
                }
                Err(err) => warn!(page_type = %page_type, error = %err, "page type drive failed"),
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(cfg.idle_interval()) => {}
        }
    }
    info!("scheduler stopped");
}

pub fn spawn_if_enabled(generator: BatchGenerator, cfg: &config::Scheduler) -> Option<SchedulerHandle> {
    if !cfg.enabled {
        info!("scheduler disabled");
        return None;
    }
    Some(spawn(generator, cfg.clone()))
}
