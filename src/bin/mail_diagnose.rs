use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use content_notifier::config::{self, Config, Provider};
use content_notifier::mailer::{
    self, EmailService, GmailMailer, MailError, OAuthCredentials, OutgoingEmail,
};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Check mail configuration and credentials without touching the database"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also send a test message to this address
    #[arg(long)]
    to: Option<String>,
}

fn report_mail_error(step: &str, err: &MailError) {
    println!("{step}: FAIL [{}]", err.code());
    match err {
        MailError::Auth { kind, status, .. } => {
            println!("  kind:   {kind}");
            println!("  status: {status}");
            println!("  hint:   {}", kind.hint());
        }
        MailError::Api { status, body, .. } => {
            println!("  status: {status}");
            println!("  body:   {body}");
        }
        other => println!("  error:  {other}"),
    }
}

async fn check_token(cfg: &Config) -> Result<bool> {
    if cfg.mail.provider != Provider::Gmail {
        println!("oauth: skipped (provider is not gmail)");
        return Ok(true);
    }
    let gmail = GmailMailer::new(
        OAuthCredentials {
            client_id: cfg.mail.gmail.client_id.clone(),
            client_secret: cfg.mail.gmail.client_secret.clone(),
            refresh_token: cfg.mail.gmail.refresh_token.clone(),
        },
        mailer::sender_mailbox(&cfg.site.name, &cfg.mail.sender_email)?,
    )?;
    match gmail.exchange_token().await {
        Ok(token) => {
            println!(
                "oauth: OK (token_type={}, expires_in={})",
                token.token_type.as_deref().unwrap_or("?"),
                token.expires_in.map(|s| s.to_string()).unwrap_or_else(|| "?".into())
            );
            Ok(true)
        }
        Err(err) => {
            report_mail_error("oauth", &err);
            Ok(false)
        }
    }
}

async fn send_test(cfg: &Config, to: &str) -> Result<bool> {
    let service = mailer::from_config(cfg)?;
    let email = OutgoingEmail {
        to: to.to_string(),
        subject: format!("{} test notification", cfg.site.name),
        html: format!(
            "<p>This is a test message from {}.</p>",
            cfg.site.name
        ),
        text: format!("This is a test message from {}.", cfg.site.name),
        unsubscribe_url: None,
    };
    let result = match service.begin_run().await {
        Ok(()) => service.send(&email).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(id) => {
            println!("send: OK (provider={}, message_id={id})", service.provider());
            Ok(true)
        }
        Err(err) => {
            report_mail_error("send", &err);
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = match config::load(Some(&args.config)) {
        Ok(cfg) => {
            println!("config: OK (provider={:?}, sender={})", cfg.mail.provider, cfg.mail.sender_email);
            cfg
        }
        Err(err) => {
            println!("config: FAIL ({err})");
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut ok = check_token(&cfg).await?;
    if ok {
        if let Some(to) = args.to.as_deref() {
            ok = send_test(&cfg, to).await?;
        }
    }

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
