use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;

use content_notifier::config;
use content_notifier::db;
use content_notifier::ingest;
use content_notifier::mailer::{self, RetryPolicy};
use content_notifier::pipeline::{self, RunOptions};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Ingest content, notify subscribers about new items and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Skip scanning the content directory
    #[arg(long)]
    no_ingest: bool,

    /// Disable send retries
    #[arg(long)]
    no_retry: bool,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    if !args.no_ingest {
        let report = ingest::ingest_directory(&pool, Path::new(&cfg.app.content_dir))
            .await
            .context("content ingestion failed")?;
        info!(created = report.created, updated = report.updated, "content scanned");
    }

    let mail = mailer::from_config(&cfg)?;
    let options = RunOptions {
        retry: if args.no_retry {
            RetryPolicy::none()
        } else {
            RetryPolicy::from_config(&cfg)
        },
    };
    let report = pipeline::run_once(&pool, mail.as_ref(), &cfg.site, &options).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
