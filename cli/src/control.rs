//! HTTP control plane served on a project daemon's Unix socket.
//!
//! | Route                  | Answer                                    |
//! |------------------------|-------------------------------------------|
//! | `GET /health`          | [`HealthReport`]                          |
//! | `GET /diagnostics?file=` | [`CollectionResult`] for one file       |
//! | `GET /diagnostics/all` | [`CollectionResult`] for the project      |
//! | `POST /shutdown`       | `202`, then the daemon stops              |
//! | `POST /reset-dedup`    | forgets what was already shown            |
//!
//! Every route shares one fixed-window rate limit. Access control is the
//! socket directory's permissions.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use warden_core::ProjectService;
use warden_types::{CollectionResult, HealthReport};

use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct ControlState {
    service: ProjectService,
    limiter: Arc<RateLimiter>,
    shutdown: Arc<Notify>,
}

impl ControlState {
    #[must_use]
    pub fn new(service: ProjectService, limiter: RateLimiter, shutdown: Arc<Notify>) -> Self {
        Self {
            service,
            limiter: Arc::new(limiter),
            shutdown,
        }
    }

    #[must_use]
    pub fn service(&self) -> &ProjectService {
        &self.service
    }
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/diagnostics", get(diagnostics))
        .route("/diagnostics/all", get(diagnostics_all))
        .route("/shutdown", post(shutdown))
        .route("/reset-dedup", post(reset_dedup))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

/// Bind `path` owner-only, replacing a socket left behind by a dead daemon.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent() {
        warden_utils::ensure_secure_dir(dir)?;
    }
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()));
        }
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
    warden_utils::restrict_to_owner(path)?;
    Ok(listener)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn rate_limit(State(state): State<ControlState>, request: Request, next: Next) -> Response {
    if state.limiter.try_acquire() {
        return next.run(request).await;
    }
    tracing::warn!(path = %request.uri().path(), "Control request rate limited");
    let retry = state.limiter.retry_after().as_secs().max(1);
    let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, retry.into());
    response
}

async fn health(State(state): State<ControlState>) -> Json<HealthReport> {
    Json(state.service.health())
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    file: PathBuf,
}

async fn diagnostics(
    State(state): State<ControlState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<CollectionResult>, Response> {
    if !query.file.is_absolute() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "file must be an absolute path",
        ));
    }
    Ok(Json(state.service.collect_file(&query.file).await))
}

async fn diagnostics_all(
    State(state): State<ControlState>,
) -> Result<Json<CollectionResult>, Response> {
    state.service.collect_all().await.map(Json).map_err(|e| {
        tracing::error!("Project collection failed: {e}");
        error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })
}

async fn shutdown(State(state): State<ControlState>) -> Response {
    tracing::info!(project = %state.service.project_hash(), "Shutdown requested");
    state.shutdown.notify_one();
    (StatusCode::ACCEPTED, Json(json!({ "status": "stopping" }))).into_response()
}

async fn reset_dedup(State(state): State<ControlState>) -> Response {
    match state.service.reset_dedup() {
        Ok(()) => Json(json!({ "status": "reset" })).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}
