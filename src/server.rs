//! Admin HTTP API.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/admin/trigger-content-sync` | Ingest content and run one notification pass |
//! | `POST` | `/api/admin/reset-notifications` | Clear item flags and/or unconfirmed `sent` rows |
//! | `GET`  | `/api/admin/debug-content` | Content items with their notification flags |
//! | `GET`  | `/api/admin/check-notifications` | Ledger counts and recent entries |
//! | `GET`  | `/api/user/unsubscribe?token=` | Disable all opt-ins for a subscriber |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Admin routes require the cron secret, either as `x-cron-secret` or as a
//! bearer token. Errors are returned as `{ "error": ..., "message": ... }`.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::config::{Config, Site};
use crate::db::{self, Pool};
use crate::ingest::{self, IngestReport};
use crate::mailer::{EmailService, RetryPolicy};
use crate::pipeline::{self, PipelineError, RunOptions, RunReport};

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub mailer: Arc<dyn EmailService>,
    pub site: Arc<Site>,
    pub content_dir: Arc<PathBuf>,
    pub options: RunOptions,
    cron_secret: Arc<str>,
    /// Held for the duration of a sync so runs never overlap.
    run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(pool: Pool, mailer: Arc<dyn EmailService>, cfg: &Config) -> Self {
        Self {
            pool,
            mailer,
            site: Arc::new(cfg.site.clone()),
            content_dir: Arc::new(PathBuf::from(&cfg.app.content_dir)),
            options: RunOptions {
                retry: RetryPolicy::from_config(cfg),
            },
            cron_secret: Arc::from(cfg.server.cron_secret.as_str()),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Ingest the content directory, then notify. Serialized by the run lock.
    #[instrument(skip_all)]
    pub async fn run_sync(&self) -> Result<(IngestReport, RunReport), PipelineError> {
        let _guard = self.run_lock.lock().await;
        let ingested = ingest::ingest_directory(&self.pool, &self.content_dir).await?;
        let report =
            pipeline::run_once(&self.pool, self.mailer.as_ref(), &self.site, &self.options).await?;
        Ok((ingested, report))
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let cron = headers
            .get("x-cron-secret")
            .and_then(|v| v.to_str().ok());
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        [cron, bearer]
            .into_iter()
            .flatten()
            .any(|given| !given.is_empty() && given == &*self.cron_secret)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/admin/trigger-content-sync", post(handle_trigger))
        .route("/api/admin/reset-notifications", post(handle_reset))
        .route("/api/admin/debug-content", get(handle_debug_content))
        .route("/api/admin/check-notifications", get(handle_check))
        .route("/api/user/unsubscribe", get(handle_unsubscribe))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "admin API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

struct AppError {
    status: StatusCode,
    error: &'static str,
    message: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn unauthorized() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        error: "Unauthorized",
        message: None,
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        error: "Bad request",
        message: Some(message.into()),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    error!(%err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        error: "Internal server error",
        message: Some(err.to_string()),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Auth(ref mail) => {
                error!(code = mail.code(), %err, "mail provider authentication failed");
                AppError {
                    status: StatusCode::BAD_GATEWAY,
                    error: "Mail provider authentication failed",
                    message: Some(err.to_string()),
                }
            }
            PipelineError::Mail(_) => AppError {
                status: StatusCode::BAD_GATEWAY,
                error: "Mail provider unavailable",
                message: Some(err.to_string()),
            },
            PipelineError::Store(_) | PipelineError::Ledger(_) => internal(err),
        }
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncStats {
    new_content: u64,
    processing_time: u64,
    ingested: u64,
    sent: u64,
    failed: u64,
    skipped: u64,
    notified_items: u64,
}

async fn handle_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.authorized(&headers) {
        warn!("rejected trigger-content-sync");
        return Err(unauthorized());
    }
    let (ingested, report) = state.run_sync().await?;
    let stats = SyncStats {
        new_content: report.candidates,
        processing_time: report.duration_ms,
        ingested: ingested.created + ingested.updated,
        sent: report.sent,
        failed: report.failed,
        skipped: report.skipped,
        notified_items: report.notified_items,
    };
    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Processed {} new items; sent {} notifications",
            report.candidates, report.sent
        ),
        "stats": stats,
        "triggeredAt": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetRequest {
    #[serde(default)]
    reset_content: bool,
    #[serde(default)]
    reset_notifications: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetResults {
    content_reset: u64,
    notifications_deleted: u64,
}

async fn handle_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.authorized(&headers) {
        warn!("rejected reset-notifications");
        return Err(unauthorized());
    }
    let req: ResetRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ResetRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid body: {e}")))?
    };

    let _guard = state.run_lock.lock().await;
    let mut results = ResetResults {
        content_reset: 0,
        notifications_deleted: 0,
    };
    if req.reset_content {
        results.content_reset = db::reset_content_flags(&state.pool).await.map_err(internal)?;
    }
    if req.reset_notifications {
        results.notifications_deleted = db::delete_unconfirmed_sent(&state.pool)
            .await
            .map_err(internal)?;
    }
    info!(
        content_reset = results.content_reset,
        notifications_deleted = results.notifications_deleted,
        "notification state reset"
    );
    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Reset {} content items and deleted {} notifications",
            results.content_reset, results.notifications_deleted
        ),
        "results": results,
    })))
}

async fn handle_debug_content(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.authorized(&headers) {
        return Err(unauthorized());
    }
    let summary = db::content_flag_counts(&state.pool).await.map_err(internal)?;
    let items = db::list_content_items(&state.pool).await.map_err(internal)?;
    Ok(Json(json!({ "summary": summary, "items": items })))
}

async fn handle_check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.authorized(&headers) {
        return Err(unauthorized());
    }
    let ledger = db::ledger_summary(&state.pool).await.map_err(internal)?;
    let subscribers = db::count_active_subscribers(&state.pool)
        .await
        .map_err(internal)?;
    let unnotified = db::unnotified_content(&state.pool, Utc::now())
        .await
        .map_err(internal)?;
    let recent = db::recent_entries(&state.pool, 10).await.map_err(internal)?;
    Ok(Json(json!({
        "ledger": ledger,
        "activeSubscribers": subscribers,
        "unnotifiedContent": unnotified,
        "recentNotifications": recent,
    })))
}

#[derive(Deserialize)]
struct UnsubscribeQuery {
    token: Option<String>,
}

async fn handle_unsubscribe(
    State(state): State<AppState>,
    Query(query): Query<UnsubscribeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = query
        .token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| bad_request("missing token"))?;
    if db::unsubscribe(&state.pool, &token).await.map_err(internal)? {
        info!("subscriber unsubscribed");
        Ok(Json(json!({ "success": true })))
    } else {
        Err(AppError {
            status: StatusCode::NOT_FOUND,
            error: "Not found",
            message: Some("unknown unsubscribe token".into()),
        })
    }
}
