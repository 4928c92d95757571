use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use content_notifier::config;
use content_notifier::db;
use content_notifier::mailer::{self, EmailService};
use content_notifier::server::{self, AppState};

#[derive(Debug, Parser)]
#[command(author, version, about)]
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let mail = mailer::from_config(&cfg)?;
    info!(provider = mail.provider(), "mail provider ready");
    let state = AppState::new(pool, mail, &cfg);

    // Periodic sync, one run at a time (the state's run lock also guards manual triggers).
    if cfg.app.sync_interval_secs > 0 {
        let worker = state.clone();
        let every = Duration::from_secs(cfg.app.sync_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match worker.run_sync().await {
                    Ok((ingested, report)) => info!(
                        created = ingested.created,
                        updated = ingested.updated,
                        sent = report.sent,
                        failed = report.failed,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(?err, "scheduled sync failed"),
                }
            }
        });
    }

    server::serve(state, &cfg.server.bind).await
}
