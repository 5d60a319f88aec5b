use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use prerender_cache::app::Services;
use prerender_cache::blob::FsBlobStore;
use prerender_cache::catalog::StaticCatalog;
use prerender_cache::render::TemplateRenderer;
use prerender_cache::{config, db, http, scheduler, shutdown};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Serve pre-rendered pages to crawlers and keep the page cache built"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let catalog = StaticCatalog::load(Path::new(&cfg.catalog.path))?;
    let renderer = TemplateRenderer::new(&cfg.app.base_url, &cfg.app.site_name);
    let (stop, admin_shutdown) = shutdown::channel();
    let services = Services::new(
        &cfg,
        pool,
        Arc::new(FsBlobStore::new(cfg.app.blob_dir())),
        Arc::new(catalog),
        Arc::new(renderer),
        admin_shutdown,
    );

    let scheduler = scheduler::spawn_if_enabled(services.generator.clone(), &cfg.scheduler);

    let app = http::router(http::AppState {
        services,
        crawler_header: cfg.serve.crawler_header.clone(),
        base_url: cfg.app.base_url.clone(),
        site_name: cfg.app.site_name.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&cfg.serve.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.serve.bind))?;
    info!(bind = %cfg.serve.bind, "serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            // Admin-triggered batches stop at the next item.
            stop.trigger();
        })
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    info!("stopped");
    Ok(())
}
