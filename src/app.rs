//! Wiring of the cache services over one pool, one blob store and the two
//! collaborators.
use std::sync::Arc;

use crate::admin::Admin;
use crate::blob::BlobStore;
use crate::config::Config;
use crate::db::Pool;
use crate::generator::BatchGenerator;
use crate::progress::ProgressTracker;
use crate::purge::PurgeController;
use crate::resolver::Resolver;
use crate::shutdown::Shutdown;
use crate::source::{PageRenderer, PageSource};
use crate::store::CacheStore;

#[derive(Clone)]
pub struct Services {
    pub store: CacheStore,
    pub generator: BatchGenerator,
    pub progress: ProgressTracker,
    pub purge: PurgeController,
    pub resolver: Resolver,
    pub admin: Admin,
}

impl Services {
    pub fn new(
        cfg: &Config,
        pool: Pool,
        blobs: Arc<dyn BlobStore>,
        source: Arc<dyn PageSource>,
        renderer: Arc<dyn PageRenderer>,
        shutdown: Shutdown,
    ) -> Self {
        let store = CacheStore::new(pool, blobs);
        let generator = BatchGenerator::new(
            store.clone(),
            source.clone(),
            renderer,
            cfg.generator.max_batch_size,
            cfg.generator.stall_timeout(),
        );
        let progress = ProgressTracker::new(store.clone(), source);
        let purge = PurgeController::new(store.clone(), progress.clone());
        let resolver = Resolver::new(store.clone(), generator.clone(), cfg.serve.crawler_only);
        let admin = Admin::new(
            store.clone(),
            generator.clone(),
            progress.clone(),
            purge.clone(),
            cfg.generator.default_batch_size,
            shutdown,
        );
        Self {
            store,
            generator,
            progress,
            purge,
            resolver,
            admin,
        }
    }
}
