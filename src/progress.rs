//! Read side of the per-type build cursors plus cache counts.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::{CacheError, Result};
use crate::model::{GenerationProgress, PageType};
use crate::source::PageSource;
use crate::store::CacheStore;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub cached: u64,
    pub stale: u64,
    pub total_possible: u64,
    pub cached_by_type: BTreeMap<PageType, u64>,
    /// One row per page type, synthesized `idle` for types never generated.
    pub progress: Vec<GenerationProgress>,
}

#[derive(Clone)]
pub struct ProgressTracker {
    pool: Pool,
    store: CacheStore,
    source: Arc<dyn PageSource>,
}

impl ProgressTracker {
    pub fn new(store: CacheStore, source: Arc<dyn PageSource>) -> Self {
        Self {
            pool: store.pool().clone(),
            store,
            source,
        }
    }

    pub async fn get(&self, page_type: PageType) -> Result<GenerationProgress> {
        Ok(db::get_progress(&self.pool, page_type)
            .await
            .map_err(|e| CacheError::backend(format!("{e:#}")))?
            .unwrap_or_else(|| GenerationProgress::unstarted(page_type)))
    }

    #[instrument(skip_all)]
    pub async fn get_stats(&self) -> Result<Stats> {
        let rows = db::list_progress(&self.pool)
            .await
            .map_err(|e| CacheError::backend(format!("{e:#}")))?;
        let progress: Vec<GenerationProgress> = PageType::ALL
            .iter()
            .map(|pt| {
                rows.iter()
                    .find(|row| row.page_type == *pt)
                    .cloned()
                    .unwrap_or_else(|| GenerationProgress::unstarted(*pt))
            })
            .collect();

        let mut cached_by_type: BTreeMap<PageType, u64> =
            PageType::ALL.iter().map(|pt| (*pt, 0)).collect();
        for (pt, count) in self.store.counts().await? {
            cached_by_type.insert(pt, count);
        }

        let mut total_possible = 0u64;
        for row in &progress {
            total_possible += match self.source.count(row.page_type).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(page_type = %row.page_type, %err, "source count unavailable, using last known total");
                    row.total_count
                }
            };
        }

        Ok(Stats {
            cached: cached_by_type.values().sum(),
            stale: self.store.count_stale().await?,
            total_possible,
            cached_by_type,
            progress,
        })
    }

    /// Rewind one or all cursors to idle at offset 0. Never touches entries.
    #[instrument(skip_all)]
    pub async fn reset(&self, page_type: Option<PageType>) -> Result<u64> {
        let rows = db::reset_progress(&self.pool, page_type)
            .await
            .map_err(|e| CacheError::backend(format!("{e:#}")))?;
        info!(
            page_type = page_type.map(|pt| pt.as_str()).unwrap_or("all"),
            rows,
            "progress reset"
        );
        Ok(rows)
    }
}
