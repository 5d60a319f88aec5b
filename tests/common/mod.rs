#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use prerender_cache::app::Services;
use prerender_cache::blob::{BlobError, BlobStore, FsBlobStore};
use prerender_cache::config::{self, Config};
use prerender_cache::db::{self, Pool};
use prerender_cache::model::{NaturalKey, PageType};
use prerender_cache::shutdown::{self, ShutdownHandle};
use prerender_cache::source::{PageRenderer, PageSource, RenderError, SourceError};
use tempfile::TempDir;
use tokio::sync::{Mutex, Notify, Semaphore};

pub fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.scheduler.inter_call_delay_ms = 1;
    cfg.scheduler.idle_interval_secs = 3600;
    cfg
}

/// A key that maps to a valid canonical path for `page_type`.
pub fn key_for(page_type: PageType, i: usize) -> NaturalKey {
    NaturalKey(match page_type {
        PageType::State => format!("s{i}"),
        PageType::City => format!("s0/c{i}"),
        PageType::Service => format!("svc{i}"),
        PageType::ServiceLocation => format!("s0/c0/svc{i}"),
        PageType::EntityDetail => format!("e{i}"),
    })
}

/// In-memory source with a switch that makes every call fail.
#[derive(Default)]
pub struct VecSource {
    keys: std::sync::Mutex<HashMap<PageType, Vec<NaturalKey>>>,
    down: AtomicBool,
}

impl VecSource {
    pub fn with_counts(counts: &[(PageType, usize)]) -> Self {
        let source = VecSource::default();
        for (pt, n) in counts {
            source.set_count(*pt, *n);
        }
        source
    }

    pub fn set_count(&self, page_type: PageType, n: usize) {
        let keys = (0..n).map(|i| key_for(page_type, i)).collect();
        self.keys.lock().unwrap().insert(page_type, keys);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), SourceError> {
        if self.down.load(Ordering::SeqCst) {
            Err(SourceError::Unavailable("source is down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PageSource for VecSource {
    async fn count(&self, page_type: PageType) -> Result<u64, SourceError> {
        self.check()?;
        let keys = self.keys.lock().unwrap();
        Ok(keys.get(&page_type).map_or(0, |k| k.len() as u64))
    }

    async fn fetch_slice(
        &self,
        page_type: PageType,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<NaturalKey>, SourceError> {
        self.check()?;
        let keys = self.keys.lock().unwrap();
        Ok(keys
            .get(&page_type)
            .map(|k| {
                k.iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Renders `<p>{key} v{n}</p>`, records every call and fails chosen keys.
/// Bumping the version changes the content of every later render.
#[derive(Default)]
pub struct RecordingRenderer {
    calls: Mutex<Vec<(PageType, NaturalKey)>>,
    failing: std::sync::Mutex<HashSet<String>>,
    version: AtomicU64,
}

impl RecordingRenderer {
    pub fn failing(keys: &[&str]) -> Self {
        let renderer = RecordingRenderer::default();
        renderer
            .failing
            .lock()
            .unwrap()
            .extend(keys.iter().map(|k| k.to_string()));
        renderer
    }

    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<(PageType, NaturalKey)> {
        self.calls.lock().await.clone()
    }

    pub async fn calls_for(&self, key: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(_, k)| k.as_str() == key)
            .count()
    }
}

#[async_trait]
impl PageRenderer for RecordingRenderer {
    async fn render(&self, page_type: PageType, key: &NaturalKey) -> Result<String, RenderError> {
        self.calls.lock().await.push((page_type, key.clone()));
        if self.failing.lock().unwrap().contains(key.as_str()) {
            return Err(RenderError::Failed(format!("template error for {key}")));
        }
        Ok(format!(
            "<p>{} v{}</p>",
            key,
            self.version.load(Ordering::SeqCst)
        ))
    }
}

/// Blocks every render until released, signalling when a render has started.
pub struct GatedRenderer {
    pub entered: Arc<Notify>,
    pub release: Arc<Semaphore>,
    pub inner: RecordingRenderer,
}

impl GatedRenderer {
    pub fn new() -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
            inner: RecordingRenderer::default(),
        }
    }

    /// Let every current and future render through.
    pub fn open(&self) {
        self.release.add_permits(1 << 20);
    }
}

#[async_trait]
impl PageRenderer for GatedRenderer {
    async fn render(&self, page_type: PageType, key: &NaturalKey) -> Result<String, RenderError> {
        self.entered.notify_one();
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|e| RenderError::Failed(e.to_string()))?;
        permit.forget();
        self.inner.render(page_type, key).await
    }
}

/// File blob store that starts failing as unavailable after a number of puts,
/// and can hold puts until released.
pub struct FlakyBlobStore {
    inner: FsBlobStore,
    puts_left: AtomicI64,
    hold_puts: AtomicBool,
    pub put_entered: Notify,
    put_release: Notify,
}

impl FlakyBlobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            inner: FsBlobStore::new(dir),
            puts_left: AtomicI64::new(i64::MAX),
            hold_puts: AtomicBool::new(false),
            put_entered: Notify::new(),
            put_release: Notify::new(),
        }
    }

    pub fn fail_after(&self, puts: i64) {
        self.puts_left.store(puts, Ordering::SeqCst);
    }

    /// Park the next put before it writes anything.
    pub fn hold_next_put(&self) {
        self.hold_puts.store(true, Ordering::SeqCst);
    }

    pub fn release_put(&self) {
        self.put_release.notify_one();
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, key: &str, content: &[u8]) -> Result<(), BlobError> {
        if self.hold_puts.swap(false, Ordering::SeqCst) {
            self.put_entered.notify_one();
            self.put_release.notified().await;
        }
        if self.puts_left.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(BlobError::Unavailable("blob volume detached".into()));
        }
        self.inner.put(key, content).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.inner.delete(key).await
    }
}

pub struct Harness {
    pub services: Services,
    pub pool: Pool,
    pub blob_dir: PathBuf,
    pub blobs: Arc<FlakyBlobStore>,
    pub stop: ShutdownHandle,
    pub cfg: Config,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(source: Arc<dyn PageSource>, renderer: Arc<dyn PageRenderer>) -> Self {
        Self::with_config(test_config(), source, renderer).await
    }

    pub async fn with_config(
        cfg: Config,
        source: Arc<dyn PageSource>,
        renderer: Arc<dyn PageRenderer>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::init_pool(&format!("sqlite://{}/test.db", dir.path().display()))
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        let blob_dir = dir.path().join("blobs");
        std::fs::create_dir_all(&blob_dir).unwrap();
        let blobs = Arc::new(FlakyBlobStore::new(blob_dir.clone()));
        let (stop, shutdown) = shutdown::channel();
        let services = Services::new(&cfg, pool.clone(), blobs.clone(), source, renderer, shutdown);
        Self {
            services,
            pool,
            blob_dir,
            blobs,
            stop,
            cfg,
            _dir: dir,
        }
    }

    /// Number of blob files on disk.
    pub fn blob_files(&self) -> usize {
        fn walk(dir: &std::path::Path) -> usize {
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .flatten()
                        .map(|e| {
                            let p = e.path();
                            if p.is_dir() {
                                walk(&p)
                            } else {
                                1
                            }
                        })
                        .sum()
                })
                .unwrap_or(0)
        }
        walk(&self.blob_dir)
    }
}
