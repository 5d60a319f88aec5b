use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use prerender_cache::admin::AdminRequest;
use prerender_cache::app::Services;
use prerender_cache::blob::FsBlobStore;
use prerender_cache::catalog::StaticCatalog;
use prerender_cache::model::PageType;
use prerender_cache::render::TemplateRenderer;
use prerender_cache::shutdown::Shutdown;
use prerender_cache::{config, db};

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and maintain the page cache")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Cached counts and per-type progress
    Stats,
    /// Cached entries of one page type
    List {
        #[arg(long)]
        page_type: String,
        /// Only entries flagged stale
        #[arg(long)]
        stale: bool,
    },
    /// Run one batch for a page type
    Generate {
        #[arg(long)]
        page_type: String,
        #[arg(long)]
        batch_size: Option<u32>,
        #[arg(long)]
        reset: bool,
    },
    /// Rewind progress for one page type, or all of them
    Reset {
        #[arg(long)]
        page_type: Option<String>,
    },
    /// Delete cached pages: a page type, `stale`, or `all` (default)
    Purge {
        #[arg(long)]
        scope: Option<String>,
    },
    /// Flag entries for regeneration on their next crawler hit
    MarkStale {
        #[arg(long)]
        page_type: Option<String>,
        #[arg(long)]
        natural_key: Option<String>,
        #[arg(long)]
        path: Option<String>,
    },
    /// Re-render one cached path now
    Regenerate {
        #[arg(long)]
        path: String,
    },
}

impl TryFrom<Command> for AdminRequest {
    type Error = anyhow::Error;

    fn try_from(command: Command) -> Result<Self> {
        Ok(match command {
            Command::Stats => AdminRequest::Stats,
            Command::List { .. } => bail!("`list` is not an admin action"),
            Command::Generate {
                page_type,
                batch_size,
                reset,
            } => AdminRequest::Generate {
                page_type,
                batch_size,
                reset,
            },
            Command::Reset { page_type } => AdminRequest::Reset { page_type },
            Command::Purge { scope } => AdminRequest::ClearCache { page_type: scope },
            Command::MarkStale {
                page_type,
                natural_key,
                path,
            } => AdminRequest::MarkStale {
                page_type,
                natural_key,
                path,
            },
            Command::Regenerate { path } => AdminRequest::Regenerate { path },
        })
    }
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
    let services = Services::new(
        &cfg,
        pool,
        Arc::new(FsBlobStore::new(cfg.app.blob_dir())),
        Arc::new(catalog),
        Arc::new(TemplateRenderer::new(&cfg.app.base_url, &cfg.app.site_name)),
        Shutdown::never(),
    );

    let output = match args.command {
        Command::List { page_type, stale } => {
            let page_type = PageType::parse(&page_type)
                .with_context(|| format!("unknown page type `{page_type}`"))?;
            let entries = services.store.list_by_type(page_type, stale).await?;
            serde_json::to_string_pretty(&entries)?
        }
        command => {
            let response = services
                .admin
                .dispatch(AdminRequest::try_from(command)?)
                .await
                .context("admin action failed")?;
            serde_json::to_string_pretty(&response)?
        }
    };
    println!("{output}");
    Ok(())
}
