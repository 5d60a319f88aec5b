//! Administrative actions, a closed set dispatched exhaustively.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::{CacheError, Result};
use crate::generator::BatchGenerator;
use crate::model::{BatchResult, NaturalKey, PageType, PurgeScope};
use crate::paths;
use crate::progress::{ProgressTracker, Stats};
use crate::purge::PurgeController;
use crate::shutdown::Shutdown;
use crate::store::CacheStore;

/// JSON body of an admin call, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminRequest {
    #[serde(rename_all = "camelCase")]
    Generate {
        page_type: String,
        #[serde(default)]
        batch_size: Option<u32>,
        #[serde(default)]
        reset: bool,
    },
    Stats,
    #[serde(rename_all = "camelCase")]
    Reset {
        #[serde(default)]
        page_type: Option<String>,
    },
    /// `page_type` may also be `stale` or `all`; absent means all.
    #[serde(rename_all = "camelCase")]
    ClearCache {
        #[serde(default)]
        page_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MarkStale {
        #[serde(default)]
        page_type: Option<String>,
        #[serde(default)]
        natural_key: Option<String>,
        #[serde(default)]
        path: Option<String>,
    },
    Regenerate {
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AdminResponse {
    Batch(BatchResult),
    Stats(Stats),
    #[serde(rename_all = "camelCase")]
    Reset { success: bool },
    #[serde(rename_all = "camelCase")]
    Cleared {
        success: bool,
        deleted: u64,
        page_type: String,
    },
    #[serde(rename_all = "camelCase")]
    Marked { success: bool, marked: u64 },
    #[serde(rename_all = "camelCase")]
    Regenerated {
        success: bool,
        path: String,
        generated_at: DateTime<Utc>,
    },
}

fn parse_page_type(raw: &str) -> Result<PageType> {
    PageType::parse(raw).ok_or_else(|| CacheError::validation(format!("unknown page type `{raw}`")))
}

#[derive(Clone)]
pub struct Admin {
    store: CacheStore,
    generator: BatchGenerator,
    progress: ProgressTracker,
    purge: PurgeController,
    default_batch_size: u32,
    shutdown: Shutdown,
}

impl Admin {
    pub fn new(
        store: CacheStore,
        generator: BatchGenerator,
        progress: ProgressTracker,
        purge: PurgeController,
        default_batch_size: u32,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            generator,
            progress,
            purge,
            default_batch_size,
            shutdown,
        }
    }

    #[instrument(skip_all)]
    pub async fn dispatch(&self, request: AdminRequest) -> Result<AdminResponse> {
        match request {
            AdminRequest::Generate {
                page_type,
                batch_size,
                reset,
            } => {
                let page_type = parse_page_type(&page_type)?;
                let batch_size = batch_size.unwrap_or(self.default_batch_size);
                let result = self
                    .generator
                    .run_batch(page_type, batch_size, reset, &self.shutdown)
                    .await?;
                Ok(AdminResponse::Batch(result))
            }
            AdminRequest::Stats => Ok(AdminResponse::Stats(self.progress.get_stats().await?)),
            AdminRequest::Reset { page_type } => {
                let page_type = page_type.as_deref().map(parse_page_type).transpose()?;
                self.purge.reset(page_type).await?;
                Ok(AdminResponse::Reset { success: true })
            }
            AdminRequest::ClearCache { page_type } => {
                let scope = PurgeScope::parse(page_type.as_deref()).ok_or_else(|| {
                    CacheError::validation(format!(
                        "unknown purge scope `{}`",
                        page_type.as_deref().unwrap_or_default()
                    ))
                })?;
                let deleted = self.purge.purge(scope).await?;
                Ok(AdminResponse::Cleared {
                    success: true,
                    deleted,
                    page_type: scope.label().to_string(),
                })
            }
            AdminRequest::MarkStale {
                page_type,
                natural_key,
                path,
            } => {
                let marked = match (path, page_type) {
                    (Some(path), _) => {
                        let path = paths::canonicalize(&path)?;
                        self.store.mark_stale_path(&path).await?
                    }
                    (None, Some(page_type)) => {
                        let page_type = parse_page_type(&page_type)?;
                        let key = natural_key.map(NaturalKey);
                        self.store.mark_stale(page_type, key.as_ref()).await?
                    }
                    (None, None) => {
                        return Err(CacheError::validation(
                            "mark_stale needs a path or a page type",
                        ))
                    }
                };
                info!(marked, "entries marked stale");
                Ok(AdminResponse::Marked {
                    success: true,
                    marked,
                })
            }
            AdminRequest::Regenerate { path } => {
                let path = paths::canonicalize(&path)?;
                let entry = self
                    .store
                    .get(&path)
                    .await?
                    .ok_or_else(|| CacheError::NotFound(format!("no cache entry for `{path}`")))?;
                let fresh = self
                    .generator
                    .regenerate_one(entry.page_type, &entry.natural_key)
                    .await?;
                Ok(AdminResponse::Regenerated {
                    success: true,
                    path: fresh.path,
                    generated_at: fresh.generated_at,
                })
            }
        }
    }
}
