//! Request-time read path: hit, stale or miss.
//!
//! A stale hit is served as-is and a regeneration of that one path is spawned
//! in the background. At most one regeneration per path is in flight.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::error::{CacheError, Result};
use crate::generator::BatchGenerator;
use crate::model::{CacheEntry, CacheStatus};
use crate::paths;
use crate::store::CacheStore;

/// Who is asking. Only crawlers are served from the cache when gating is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Crawler,
    Visitor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: String,
    pub status: CacheStatus,
    pub html: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl Resolution {
    fn miss(path: String) -> Self {
        Self {
            path,
            status: CacheStatus::Miss,
            html: None,
            generated_at: None,
        }
    }
}

/// Paths with a background regeneration currently running.
#[derive(Default, Clone)]
pub struct InFlightRegenerations {
    paths: Arc<DashMap<String, ()>>,
}

impl InFlightRegenerations {
    pub fn acquire(&self, path: &str) -> Option<RegenerationGuard> {
        use dashmap::mapref::entry::Entry;

        match self.paths.entry(path.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(RegenerationGuard {
                    path: path.to_string(),
                    paths: Arc::clone(&self.paths),
                })
            }
            Entry::Occupied(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

pub struct RegenerationGuard {
    path: String,
    paths: Arc<DashMap<String, ()>>,
}

impl Drop for RegenerationGuard {
    fn drop(&mut self) {
        self.paths.remove(&self.path);
    }
}

#[derive(Clone)]
pub struct Resolver {
    store: CacheStore,
    generator: BatchGenerator,
    crawler_only: bool,
    in_flight: InFlightRegenerations,
}

impl Resolver {
    pub fn new(store: CacheStore, generator: BatchGenerator, crawler_only: bool) -> Self {
        Self {
            store,
            generator,
            crawler_only,
            in_flight: InFlightRegenerations::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlightRegenerations {
        &self.in_flight
    }

    /// Look `path` up in the cache. A miss is a normal outcome, not an error.
    #[instrument(skip_all, fields(path = raw_path))]
    pub async fn resolve(&self, raw_path: &str, caller: Caller, test_mode: bool) -> Result<Resolution> {
        let path = paths::canonicalize(raw_path)?;
        if self.crawler_only && caller != Caller::Crawler && !test_mode {
            debug!("caller is not a crawler");
            return Ok(Resolution::miss(path));
        }

        let Some(entry) = self.store.get(&path).await? else {
            return Ok(Resolution::miss(path));
        };
        let (entry, html) = match self.load(&entry).await? {
            Some(html) => (entry, html),
            // The row may have been swapped between the lookup and the read.
            None => match self.store.get(&path).await? {
                Some(fresh) => match self.load(&fresh).await? {
                    Some(html) => (fresh, html),
                    None => {
                        warn!("cache entry has no blob");
                        return Ok(Resolution::miss(path));
                    }
                },
                None => return Ok(Resolution::miss(path)),
            },
        };

        let status = if entry.is_stale {
            self.schedule_regeneration(&entry);
            CacheStatus::Stale
        } else {
            CacheStatus::Hit
        };
        Ok(Resolution {
            path,
            status,
            html: Some(html),
            generated_at: Some(entry.generated_at),
        })
    }

    /// Blob read; unreadable content degrades to a miss, an unreachable
    /// store does not.
    async fn load(&self, entry: &CacheEntry) -> Result<Option<String>> {
        match self.store.load_html(entry).await {
            Ok(html) => Ok(html),
            Err(err @ CacheError::BackendUnavailable(_)) => Err(err),
            Err(err) => {
                warn!(error = %err, "unreadable cache blob");
                Ok(None)
            }
        }
    }

    fn schedule_regeneration(&self, entry: &CacheEntry) {
        let Some(guard) = self.in_flight.acquire(&entry.path) else {
            debug!("regeneration already in flight");
            return;
        };
        let generator = self.generator.clone();
        let page_type = entry.page_type;
        let key = entry.natural_key.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match generator.regenerate_one(page_type, &key).await {
                Ok(fresh) => info!(path = %fresh.path, "stale page regenerated"),
                Err(err) => warn!(%page_type, %key, error = %err, "stale page regeneration failed"),
            }
        });
    }
}
