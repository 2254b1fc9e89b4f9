//! Sync endpoint routes.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use tillsync_engine::{
    PullQuery, PullResponse, PushRequest, PushResponse, SnapshotResponse, SyncLogEntry,
};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{
    handle_append_logs, handle_list_logs, handle_pull, handle_push, handle_snapshot,
    AppendResponse, LogListResponse, LogQuery,
};
use crate::AppState;

/// Sync routes, mounted under `/sync`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/push", post(push_handler))
        .route("/pull", get(pull_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/logs", get(list_logs_handler).post(append_logs_handler))
}

/// POST /sync/push - Admit queued changes.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let response = handle_push(
        &state.pool,
        &state.schema,
        request,
        state.config.max_push_changes,
    )
    .await?;
    Ok(Json(response))
}

/// GET /sync/pull - Records written after `since`.
async fn pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>> {
    let response = handle_pull(&state.pool, query).await?;
    Ok(Json(response))
}

/// GET /sync/snapshot - Full record set for a reset.
async fn snapshot_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<SnapshotResponse>> {
    let response = handle_snapshot(&state.pool).await?;
    Ok(Json(response))
}

/// POST /sync/logs - Append device audit entries.
async fn append_logs_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(entries): Json<Vec<SyncLogEntry>>,
) -> Result<Json<AppendResponse>> {
    let response = handle_append_logs(&state.pool, entries).await?;
    Ok(Json(response))
}

/// GET /sync/logs - Recent audit entries.
async fn list_logs_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogListResponse>> {
    let response = handle_list_logs(&state.pool, query).await?;
    Ok(Json(response))
}
