//! Cache store: entry rows in SQLite, rendered HTML in the blob store.
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::blob::{self, BlobError, BlobStore};
use crate::db::{self, EntryUpsert, Pool};
use crate::error::{is_connectivity_error, CacheError, Result};
use crate::model::{CacheEntry, NaturalKey, PageType, PurgeScope, StaleTarget};

#[derive(Clone)]
pub struct CacheStore {
    pool: Pool,
    blobs: Arc<dyn BlobStore>,
}

pub fn content_hash(html: &str) -> String {
    hex::encode(Sha256::digest(html.as_bytes()))
}

/// Repository failures outside an item upsert are always systemic.
fn db_unavailable(err: anyhow::Error) -> CacheError {
    CacheError::backend(format!("database: {err:#}"))
}

fn blob_failure(path: &str, err: BlobError) -> CacheError {
    match err {
        BlobError::Unavailable(msg) => CacheError::BackendUnavailable(msg),
        other => CacheError::Storage {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}

impl CacheStore {
    pub fn new(pool: Pool, blobs: Arc<dyn BlobStore>) -> Self {
        Self { pool, blobs }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Store freshly rendered HTML for `path`, replacing any previous entry.
    ///
    /// The blob is written under a new key first, then the row is swapped in
    /// one statement, then the blob the old row pointed at is removed. A blob
    /// is never shared between two rows or two renders.
    #[instrument(skip_all, fields(page_type = %page_type, path = path))]
    pub async fn upsert_rendered(
        &self,
        page_type: PageType,
        key: &NaturalKey,
        path: &str,
        html: &str,
    ) -> Result<CacheEntry> {
        let hash = content_hash(html);
        let html_ref = blob::key_for(page_type, path, &hash);
        self.blobs
            .put(&html_ref, html.as_bytes())
            .await
            .map_err(|e| blob_failure(path, e))?;

        let generated_at = Utc::now();
        let upsert = EntryUpsert {
            path,
            page_type,
            natural_key: key,
            html_ref: &html_ref,
            content_hash: &hash,
            generated_at,
        };
        let previous = match db::upsert_entry(&self.pool, &upsert).await {
            Ok(previous) => previous,
            Err(e) => {
                if let Err(cleanup) = self.blobs.delete(&html_ref).await {
                    warn!(?cleanup, html_ref = %html_ref, "failed to remove orphaned blob");
                }
                return Err(self.classify_item_db_error(path, e));
            }
        };

        if let Some(old) = previous {
            if let Err(err) = self.blobs.delete(&old).await {
                warn!(?err, html_ref = %old, "failed to remove replaced blob");
            }
        }
        debug!(html_ref = %html_ref, "cache entry stored");

        Ok(CacheEntry {
            path: path.to_string(),
            page_type,
            natural_key: key.clone(),
            html_ref,
            content_hash: hash,
            generated_at,
            is_stale: false,
        })
    }

    fn classify_item_db_error(&self, path: &str, err: anyhow::Error) -> CacheError {
        if is_connectivity_error(&err) {
            db_unavailable(err)
        } else {
            CacheError::Storage {
                path: path.to_string(),
                message: format!("{err:#}"),
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<Option<CacheEntry>> {
        db::get_entry(&self.pool, path).await.map_err(db_unavailable)
    }

    /// HTML behind `entry`; `None` when the blob has gone missing.
    pub async fn load_html(&self, entry: &CacheEntry) -> Result<Option<String>> {
        let bytes = self
            .blobs
            .get(&entry.html_ref)
            .await
            .map_err(|e| blob_failure(&entry.path, e))?;
        bytes
            .map(|b| {
                String::from_utf8(b).map_err(|e| CacheError::Storage {
                    path: entry.path.clone(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    pub async fn list_by_type(&self, page_type: PageType, stale_only: bool) -> Result<Vec<CacheEntry>> {
        db::list_entries_by_type(&self.pool, page_type, stale_only)
            .await
            .map_err(db_unavailable)
    }

    pub async fn count_by_type(&self, page_type: PageType) -> Result<u64> {
        db::count_entries_by_type(&self.pool, page_type)
            .await
            .map_err(db_unavailable)
    }

    pub async fn counts(&self) -> Result<Vec<(PageType, u64)>> {
        db::count_entries_grouped(&self.pool)
            .await
            .map_err(db_unavailable)
    }

    pub async fn count_stale(&self) -> Result<u64> {
        db::count_stale_entries(&self.pool).await.map_err(db_unavailable)
    }

    /// Delete matching entries and their blobs. Blob removal is best effort:
    /// a leftover file is unreachable once its row is gone.
    #[instrument(skip_all, fields(scope = scope.label()))]
    pub async fn delete(&self, scope: PurgeScope) -> Result<u64> {
        let refs = db::delete_entries(&self.pool, scope)
            .await
            .map_err(db_unavailable)?;
        for html_ref in &refs {
            match db::html_ref_in_use(&self.pool, html_ref).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, html_ref, "could not check blob usage, keeping it");
                    continue;
                }
            }
            if let Err(err) = self.blobs.delete(html_ref).await {
                warn!(?err, html_ref, "failed to remove purged blob");
            }
        }
        Ok(refs.len() as u64)
    }

    pub async fn mark_stale(&self, page_type: PageType, key: Option<&NaturalKey>) -> Result<u64> {
        let target = match key {
            Some(key) => StaleTarget::Key(page_type, key.clone()),
            None => StaleTarget::AllOfType(page_type),
        };
        db::mark_stale(&self.pool, &target).await.map_err(db_unavailable)
    }

    pub async fn mark_stale_path(&self, path: &str) -> Result<u64> {
        db::mark_stale(&self.pool, &StaleTarget::Path(path.to_string()))
            .await
            .map_err(db_unavailable)
    }
}
