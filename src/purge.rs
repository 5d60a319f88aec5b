//! Purge clears cached output; reset rewinds cursors. Neither touches the
//! other's state.
use tracing::{info, instrument};

use crate::error::Result;
use crate::model::{PageType, PurgeScope};
use crate::progress::ProgressTracker;
use crate::store::CacheStore;

#[derive(Clone)]
pub struct PurgeController {
    store: CacheStore,
    progress: ProgressTracker,
}

impl PurgeController {
    pub fn new(store: CacheStore, progress: ProgressTracker) -> Self {
        Self { store, progress }
    }

    /// Delete entries (and their blobs) in `scope`; returns how many rows went.
    #[instrument(skip_all, fields(scope = scope.label()))]
    pub async fn purge(&self, scope: PurgeScope) -> Result<u64> {
        let deleted = self.store.delete(scope).await?;
        info!(deleted, "cache purged");
        Ok(deleted)
    }

    pub async fn reset(&self, page_type: Option<PageType>) -> Result<u64> {
        self.progress.reset(page_type).await
    }
}
