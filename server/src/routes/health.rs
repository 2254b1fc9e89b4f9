//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tillsync_engine::SchemaVersion;

use crate::{db, AppState};

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the database is unreachable
    pub status: &'static str,
    pub version: &'static str,
    pub schema_version: SchemaVersion,
    pub database: &'static str,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database_up = db::ping(&state.pool).await;
    Json(HealthResponse {
        status: if database_up { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        schema_version: state.schema.version,
        database: if database_up { "up" } else { "down" },
    })
}

async fn root() -> &'static str {
    "TillSync Server"
}
