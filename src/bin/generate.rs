use anyhow::{bail, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use prerender_cache::app::Services;
use prerender_cache::blob::FsBlobStore;
use prerender_cache::catalog::StaticCatalog;
use prerender_cache::model::PageType;
use prerender_cache::render::TemplateRenderer;
use prerender_cache::scheduler::drive_to_completion;
use prerender_cache::{config, db, shutdown, CacheError};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Generate cached pages batch by batch until every selected page type is done"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Page type to generate (state, city, service, service_location, entity_detail); all when omitted
    #[arg(long)]
    page_type: Option<String>,

    /// Items per batch (defaults to generator.default_batch_size)
    #[arg(long)]
    batch_size: Option<u32>,

    /// Rewind each page type's cursor before the first batch
    #[arg(long)]
    reset: bool,

    /// Pause between batches in milliseconds (defaults to scheduler.inter_call_delay_ms)
    #[arg(long)]
    delay_ms: Option<u64>,
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

    let page_types: Vec<PageType> = match args.page_type.as_deref() {
        Some(raw) => match PageType::parse(raw) {
            Some(pt) => vec![pt],
            None => bail!("unknown page type '{}'", raw),
        },
        None => PageType::ALL.to_vec(),
    };
    let batch_size = args.batch_size.unwrap_or(cfg.generator.default_batch_size);
    let delay = std::time::Duration::from_millis(
        args.delay_ms.unwrap_or(cfg.scheduler.inter_call_delay_ms),
    );

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let catalog = StaticCatalog::load(Path::new(&cfg.catalog.path))?;
    let (stop, cancel) = shutdown::channel();
    let services = Services::new(
        &cfg,
        pool,
        Arc::new(FsBlobStore::new(cfg.app.blob_dir())),
        Arc::new(catalog),
        Arc::new(TemplateRenderer::new(&cfg.app.base_url, &cfg.app.site_name)),
        cancel.clone(),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current item");
            stop.trigger();
        }
    });

    let mut failed = 0usize;
    for page_type in page_types {
        info!(page_type = %page_type, batch_size, "generating");
        match drive_to_completion(
            &services.generator,
            page_type,
            batch_size,
            args.reset,
            delay,
            &cancel,
        )
        .await
        {
            Ok(summary) => {
                let (offset, total) = summary
                    .last
                    .as_ref()
                    .map(|b| (b.current_offset, b.total_count))
                    .unwrap_or_default();
                info!(
                    page_type = %page_type,
                    batches = summary.batches,
                    processed = summary.processed,
                    generated = summary.generated,
                    errors = summary.errors,
                    offset,
                    total,
                    done = summary.done(),
                    "page type finished"
                );
            }
            Err(CacheError::Cancelled { .. }) => {
                info!(page_type = %page_type, "generation cancelled");
                break;
            }
            Err(err) => {
                error!(page_type = %page_type, error = %err, "generation failed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} page type(s) failed", failed);
    }
    Ok(())
}
