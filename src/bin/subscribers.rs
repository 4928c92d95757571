use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use content_notifier::config;
use content_notifier::db;

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage notification subscribers")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add a subscriber, or update preferences of an existing one
    Add {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: Option<String>,
        /// Receive blog post notifications
        #[arg(long)]
        blog: bool,
        /// Receive thought notifications
        #[arg(long)]
        thought: bool,
    },
    /// List all subscribers
    List,
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

    match args.command {
        Command::Add {
            email,
            name,
            blog,
            thought,
        } => {
            // No flags means both.
            let (blog, thought) = if !blog && !thought { (true, true) } else { (blog, thought) };
            let sub = db::add_subscriber(&pool, &email, name.as_deref(), blog, thought).await?;
            println!(
                "{} blog={} thought={} unsubscribe_token={}",
                sub.email, sub.blog_updates, sub.thought_updates, sub.unsubscribe_token
            );
        }
        Command::List => {
            for sub in db::list_subscribers(&pool).await? {
                println!(
                    "{}\t{}\tblog={}\tthought={}\t{}",
                    sub.email,
                    sub.name.as_deref().unwrap_or("-"),
                    sub.blog_updates,
                    sub.thought_updates,
                    sub.created_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}
