//! TillSync Server - remote store for offline-first tills.
//!
//! Devices push queued changes, pull records written since their watermark,
//! fetch a full snapshot on reset, and ship their sync audit log. Admission
//! of every change goes through [`tillsync_engine::protocol::admit`], the same
//! rules the client's in-memory remote applies.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;

use crate::config::Config;
use crate::db::Pool;
use axum::Router;
use std::sync::Arc;
use tillsync_engine::Schema;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub schema: Arc<Schema>,
}

impl AppState {
    pub fn new(pool: Pool, config: Config) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            schema: Arc::new(Schema::business_default()),
        }
    }
}

/// Build the HTTP application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
