//! Batch generator: advances one page type's cursor by one slice per call.
//!
//! The progress row is the serialization point. A call claims it with a
//! compare-and-set into `running`, renders and upserts each key in the slice
//! (continuing past item failures), then commits the new cursor and releases
//! the claim in one conditional write keyed by the run token. A run whose
//! claim was taken over (reset or stall watchdog) never overwrites the row.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, Pool, RunOutcome};
use crate::error::{CacheError, Result};
use crate::model::{BatchResult, CacheEntry, GenerationProgress, GenerationStatus, NaturalKey, PageType};
use crate::paths;
use crate::shutdown::Shutdown;
use crate::source::{PageRenderer, PageSource};
use crate::store::CacheStore;

const LAST_ERROR_ITEMS: usize = 3;
const ERROR_DETAILS: usize = 5;

#[derive(Clone)]
pub struct BatchGenerator {
    pool: Pool,
    store: CacheStore,
    source: Arc<dyn PageSource>,
    renderer: Arc<dyn PageRenderer>,
    max_batch_size: u32,
    stall_timeout: Duration,
}

/// Where the item loop stopped.
enum LoopEnd {
    Finished,
    Cancelled,
    ClaimLost,
    Failed(CacheError),
}

impl BatchGenerator {
    pub fn new(
        store: CacheStore,
        source: Arc<dyn PageSource>,
        renderer: Arc<dyn PageRenderer>,
        max_batch_size: u32,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            pool: store.pool().clone(),
            store,
            source,
            renderer,
            max_batch_size,
            stall_timeout,
        }
    }

    /// Render and upsert the next `batch_size` keys of `page_type`.
    #[instrument(skip_all, fields(page_type = %page_type, batch_size))]
    pub async fn run_batch(
        &self,
        page_type: PageType,
        batch_size: u32,
        reset_first: bool,
        shutdown: &Shutdown,
    ) -> Result<BatchResult> {
        if batch_size == 0 || batch_size > self.max_batch_size {
            return Err(CacheError::validation(format!(
                "batch size must be between 1 and {}, got {batch_size}",
                self.max_batch_size
            )));
        }

        db::ensure_progress_row(&self.pool, page_type)
            .await
            .map_err(progress_unavailable)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let stall = chrono::Duration::from_std(self.stall_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let claimed = db::claim_progress(&self.pool, page_type, &run_id, now, now - stall)
            .await
            .map_err(progress_unavailable)?;
        if !claimed {
            debug!("progress row already claimed");
            return Err(CacheError::ConcurrencyConflict { page_type });
        }

        if reset_first {
            db::rewind_owned(&self.pool, page_type, &run_id)
                .await
                .map_err(progress_unavailable)?;
        }

        let start = self.current_row(page_type).await?;
        let start_offset = start.current_offset;

        let total_count = match self.source.count(page_type).await {
            Ok(total) => total,
            Err(err) => {
                let err = CacheError::backend(err);
                return self.abort(page_type, &run_id, start_offset, err).await;
            }
        };
        if !db::set_total_owned(&self.pool, page_type, &run_id, total_count)
            .await
            .map_err(progress_unavailable)?
        {
            return self.superseded(page_type, 0, 0, Vec::new()).await;
        }

        let keys = match self
            .source
            .fetch_slice(page_type, start_offset, u64::from(batch_size))
            .await
        {
            Ok(keys) => keys,
            Err(err) => {
                let err = CacheError::backend(err);
                return self.abort(page_type, &run_id, start_offset, err).await;
            }
        };

        let mut processed = 0u64;
        let mut generated = 0u64;
        let mut item_errors: Vec<String> = Vec::new();
        let mut end = LoopEnd::Finished;

        for key in &keys {
            if shutdown.is_cancelled() {
                end = LoopEnd::Cancelled;
                break;
            }
            match self.generate_item(page_type, key).await {
                Ok(_) => generated += 1,
                Err(err) if err.is_item_level() => {
                    warn!(key = %key, error = %err, "page generation failed");
                    item_errors.push(err.to_string());
                }
                Err(err) => {
                    end = LoopEnd::Failed(err);
                    break;
                }
            }
            processed += 1;

            match db::heartbeat(&self.pool, page_type, &run_id).await {
                Ok(true) => {}
                Ok(false) => {
                    end = LoopEnd::ClaimLost;
                    break;
                }
                Err(err) => {
                    end = LoopEnd::Failed(progress_unavailable(err));
                    break;
                }
            }
        }

        match end {
            LoopEnd::Finished => {}
            LoopEnd::Cancelled => {
                info!(processed, "batch cancelled, offset kept");
                let outcome = RunOutcome {
                    current_offset: start_offset,
                    status: GenerationStatus::Idle,
                    last_error: start.last_error.clone(),
                    completed_at: None,
                };
                if let Err(err) = db::finish_run(&self.pool, page_type, &run_id, &outcome).await {
                    warn!(?err, "failed to release cancelled run");
                }
                return Err(CacheError::Cancelled { page_type });
            }
            LoopEnd::ClaimLost => {
                warn!(processed, "claim lost mid-batch, skipping commit");
                return self
                    .superseded(page_type, processed, generated, item_errors)
                    .await;
            }
            LoopEnd::Failed(err) => {
                return self
                    .abort(page_type, &run_id, start_offset + processed, err)
                    .await;
            }
        }

        let current_offset = start_offset + processed;
        let complete = total_count > 0 && current_offset >= total_count;
        let outcome = RunOutcome {
            current_offset,
            status: if complete {
                GenerationStatus::Complete
            } else {
                GenerationStatus::Idle
            },
            last_error: summarize_errors(&item_errors),
            completed_at: complete.then(Utc::now),
        };
        let committed = db::finish_run(&self.pool, page_type, &run_id, &outcome)
            .await
            .map_err(progress_unavailable)?;
        if !committed {
            warn!(processed, "claim lost before commit, skipping commit");
            return self
                .superseded(page_type, processed, generated, item_errors)
                .await;
        }

        info!(
            processed,
            generated,
            errors = item_errors.len(),
            offset = current_offset,
            total = total_count,
            "batch committed"
        );
        Ok(batch_result(
            page_type,
            processed,
            generated,
            item_errors,
            current_offset,
            total_count,
        ))
    }

    /// Render and store one page. Does not touch progress.
    #[instrument(skip_all, fields(page_type = %page_type, key = %key))]
    pub async fn regenerate_one(&self, page_type: PageType, key: &NaturalKey) -> Result<CacheEntry> {
        self.generate_item(page_type, key).await
    }

    async fn generate_item(&self, page_type: PageType, key: &NaturalKey) -> Result<CacheEntry> {
        let path = paths::canonical_path(page_type, key).map_err(|e| CacheError::Render {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        let html = self
            .renderer
            .render(page_type, key)
            .await
            .map_err(|e| CacheError::Render {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        self.store.upsert_rendered(page_type, key, &path, &html).await
    }

    async fn current_row(&self, page_type: PageType) -> Result<GenerationProgress> {
        Ok(db::get_progress(&self.pool, page_type)
            .await
            .map_err(progress_unavailable)?
            .unwrap_or_else(|| GenerationProgress::unstarted(page_type)))
    }

    /// Systemic failure: record it on the row (if still ours) and surface it.
    async fn abort(
        &self,
        page_type: PageType,
        run_id: &str,
        current_offset: u64,
        err: CacheError,
    ) -> Result<BatchResult> {
        warn!(error = %err, offset = current_offset, "batch aborted");
        let outcome = RunOutcome {
            current_offset,
            status: GenerationStatus::Error,
            last_error: Some(err.to_string()),
            completed_at: None,
        };
        // If this write fails too the row stays `running` until the stall
        // watchdog lets the next call reclaim it.
        if let Err(write_err) = db::finish_run(&self.pool, page_type, run_id, &outcome).await {
            warn!(?write_err, "failed to record batch error");
        }
        Err(err)
    }

    /// Report the row as another owner left it.
    async fn superseded(
        &self,
        page_type: PageType,
        processed: u64,
        generated: u64,
        item_errors: Vec<String>,
    ) -> Result<BatchResult> {
        let row = self.current_row(page_type).await?;
        Ok(batch_result(
            page_type,
            processed,
            generated,
            item_errors,
            row.current_offset,
            row.total_count,
        ))
    }
}

fn progress_unavailable(err: anyhow::Error) -> CacheError {
    CacheError::backend(format!("progress store: {err:#}"))
}

fn summarize_errors(errors: &[String]) -> Option<String> {
    if errors.is_empty() {
        None
    } else {
        Some(
            errors
                .iter()
                .take(LAST_ERROR_ITEMS)
                .cloned()
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

fn batch_result(
    page_type: PageType,
    processed: u64,
    generated: u64,
    item_errors: Vec<String>,
    current_offset: u64,
    total_count: u64,
) -> BatchResult {
    BatchResult {
        page_type,
        processed,
        generated,
        errors: item_errors.len() as u64,
        error_details: item_errors.into_iter().take(ERROR_DETAILS).collect(),
        current_offset,
        total_count,
        remaining: total_count.saturating_sub(current_offset),
        done: current_offset >= total_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_keeps_first_three() {
        assert_eq!(summarize_errors(&[]), None);
        let errs: Vec<String> = (1..=5).map(|i| format!("e{i}")).collect();
        assert_eq!(summarize_errors(&errs).as_deref(), Some("e1; e2; e3"));
    }

    #[test]
    fn result_caps_details_and_saturates() {
        let errs: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        let r = batch_result(PageType::City, 8, 0, errs, 130, 120);
        assert_eq!(r.errors, 8);
        assert_eq!(r.error_details.len(), 5);
        assert_eq!(r.remaining, 0);
        assert!(r.done);
    }
}
